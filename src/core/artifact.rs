/// Backup artifact model
///
/// Every artifact is a file named
/// `{category}-{name}-{YYYYMMDD_HHMMSS}.{tar.gz|sql.gz}[.gpg]` in the
/// backup directory. The filename carries all metadata the orchestrators
/// need: no sidecar files, no database.

use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDateTime, TimeDelta};
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::core::config::RetentionWindows;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Database,
    Data,
    Config,
    Volumes,
    Logs,
}

impl Category {
    /// Fixed order used by full backup runs.
    pub const ALL: &'static [Category] = &[
        Category::Database,
        Category::Data,
        Category::Config,
        Category::Volumes,
        Category::Logs,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Category::Database => "database",
            Category::Data => "data",
            Category::Config => "config",
            Category::Volumes => "volumes",
            Category::Logs => "logs",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Category::Database => "sql.gz",
            _ => "tar.gz",
        }
    }

    /// Which retention window applies; volumes share the data window.
    pub fn retention_days(&self, windows: &RetentionWindows) -> u32 {
        match self {
            Category::Database | Category::Data | Category::Volumes => windows.data_days,
            Category::Config | Category::Logs => windows.config_days,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "database" | "db" => Ok(Category::Database),
            "data" => Ok(Category::Data),
            "config" => Ok(Category::Config),
            "volumes" | "volume" => Ok(Category::Volumes),
            "logs" => Ok(Category::Logs),
            other => Err(anyhow!(
                "unknown backup category '{}' (expected database, data, config, volumes or logs)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub category: Category,
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub encrypted: bool,
    pub size: u64,
}

impl Artifact {
    /// Age relative to `now`.
    pub fn age(&self, now: NaiveDateTime) -> TimeDelta {
        now - self.timestamp
    }

    /// Parse an artifact from its filename. Returns None for files that
    /// are not backup artifacts.
    pub fn parse(path: &Path) -> Option<Artifact> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(
                r"^(database|data|config|volumes|logs)-(.+)-(\d{8}_\d{6})\.(sql\.gz|tar\.gz)(\.gpg)?$",
            )
            .expect("valid artifact regex")
        });

        let file_name = path.file_name()?.to_str()?;
        let caps = re.captures(file_name)?;

        let category = Category::from_str(&caps[1]).ok()?;
        let timestamp = NaiveDateTime::parse_from_str(&caps[3], TIMESTAMP_FORMAT).ok()?;
        let size = path.metadata().map(|m| m.len()).unwrap_or(0);

        Some(Artifact {
            path: path.to_path_buf(),
            category,
            name: caps[2].to_string(),
            timestamp,
            encrypted: caps.get(5).is_some(),
            size,
        })
    }
}

/// Filename for a new artifact.
pub fn artifact_filename(category: Category, name: &str, timestamp: NaiveDateTime) -> String {
    format!(
        "{}-{}-{}.{}",
        category.prefix(),
        name,
        timestamp.format(TIMESTAMP_FORMAT),
        category.extension()
    )
}

/// Current second-resolution timestamp for artifact names.
pub fn now_stamp() -> NaiveDateTime {
    // Truncate to second resolution so the filename round-trips exactly
    let now = Local::now().naive_local();
    NaiveDateTime::parse_from_str(
        &now.format(TIMESTAMP_FORMAT).to_string(),
        TIMESTAMP_FORMAT,
    )
    .expect("timestamp round-trip")
}

/// All artifacts in a directory, newest first.
pub fn list(backup_dir: &Path) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();

    if !backup_dir.exists() {
        return Ok(artifacts);
    }

    for entry in std::fs::read_dir(backup_dir)
        .with_context(|| format!("Failed to read {}", backup_dir.display()))?
    {
        let entry = entry?;
        if let Some(artifact) = Artifact::parse(&entry.path()) {
            artifacts.push(artifact);
        }
    }

    artifacts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(artifacts)
}

/// Artifacts of one category, newest first.
pub fn list_category(backup_dir: &Path, category: Category) -> Result<Vec<Artifact>> {
    Ok(list(backup_dir)?
        .into_iter()
        .filter(|a| a.category == category)
        .collect())
}

/// Delete artifacts older than their category's retention window.
///
/// Age is measured against the filename timestamp, which survives copies
/// between hosts where mtime does not. Returns the deleted artifacts.
pub fn cleanup(
    backup_dir: &Path,
    windows: &RetentionWindows,
    now: NaiveDateTime,
) -> Result<Vec<Artifact>> {
    let mut deleted = Vec::new();

    for artifact in list(backup_dir)? {
        let threshold = TimeDelta::days(artifact.category.retention_days(windows) as i64);
        if artifact.age(now) >= threshold {
            std::fs::remove_file(&artifact.path)
                .with_context(|| format!("Failed to delete {}", artifact.path.display()))?;
            deleted.push(artifact);
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_filename_round_trip() {
        let stamp = ts("20250315_142233");
        let name = artifact_filename(Category::Database, "nextcloud", stamp);
        assert_eq!(name, "database-nextcloud-20250315_142233.sql.gz");

        let artifact = Artifact::parse(Path::new(&name)).unwrap();
        assert_eq!(artifact.category, Category::Database);
        assert_eq!(artifact.name, "nextcloud");
        assert_eq!(artifact.timestamp, stamp);
        assert!(!artifact.encrypted);
    }

    #[test]
    fn test_parse_encrypted_artifact() {
        let artifact =
            Artifact::parse(Path::new("volumes-db_data-20250315_142233.tar.gz.gpg")).unwrap();
        assert_eq!(artifact.category, Category::Volumes);
        assert_eq!(artifact.name, "db_data");
        assert!(artifact.encrypted);
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(Artifact::parse(Path::new("notes.txt")).is_none());
        assert!(Artifact::parse(Path::new("database-nextcloud.sql.gz")).is_none());
        assert!(Artifact::parse(Path::new("database-nc-2025_bad.sql.gz")).is_none());
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!(Category::from_str("db").unwrap(), Category::Database);
        assert_eq!(Category::from_str("VOLUMES").unwrap(), Category::Volumes);
        assert!(Category::from_str("everything").is_err());
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "database-nextcloud-20250101_000000.sql.gz",
            "database-nextcloud-20250201_000000.sql.gz",
            "data-files-20250115_000000.tar.gz",
            "unrelated.txt",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let all = list(dir.path()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, ts("20250201_000000"));

        let db = list_category(dir.path(), Category::Database).unwrap();
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_cleanup_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let windows = RetentionWindows {
            data_days: 14,
            config_days: 30,
        };
        let now = ts("20250315_120000");

        // One second younger than the window, one second older
        let young = now - Duration::days(14) + Duration::seconds(1);
        let old = now - Duration::days(14) - Duration::seconds(1);

        let young_name = artifact_filename(Category::Database, "nextcloud", young);
        let old_name = artifact_filename(Category::Database, "nextcloud", old);
        // Encrypted sibling past the window is matched too
        let old_enc = format!(
            "{}.gpg",
            artifact_filename(Category::Data, "files", old)
        );
        // Config window is longer: same age survives
        let config_name = artifact_filename(Category::Config, "bundle", old);

        for name in [&young_name, &old_name, &old_enc, &config_name] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let deleted = cleanup(dir.path(), &windows, now).unwrap();
        let deleted_names: Vec<String> = deleted
            .iter()
            .map(|a| a.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(deleted.len(), 2);
        assert!(deleted_names.contains(&old_name));
        assert!(deleted_names.contains(&old_enc));
        assert!(dir.path().join(&young_name).exists());
        assert!(dir.path().join(&config_name).exists());
    }

    #[test]
    fn test_cleanup_exactly_at_threshold_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let windows = RetentionWindows {
            data_days: 14,
            config_days: 30,
        };
        let now = ts("20250315_120000");

        let at_threshold = now - Duration::days(14);
        let name = artifact_filename(Category::Database, "nextcloud", at_threshold);
        std::fs::write(dir.path().join(&name), b"x").unwrap();

        let deleted = cleanup(dir.path(), &windows, now).unwrap();
        assert_eq!(deleted.len(), 1);
    }
}
