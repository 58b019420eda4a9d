/// Configuration management for the deployment .env file
///
/// Handles reading, writing, and validating stack configuration.
/// Orchestrators never touch the raw file: they receive an immutable
/// `Settings` loaded once at process start.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ConfigValue {
    pub key: String,
    pub value: String,
    pub comment: Option<String>,
}

pub struct ConfigManager {
    env_file: PathBuf,
    config: HashMap<String, ConfigValue>,
}

impl ConfigManager {
    /// Load configuration from .env file
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let env_file = env_file.as_ref().to_path_buf();

        if !env_file.exists() {
            return Err(anyhow!(".env file not found at {}", env_file.display()));
        }

        let content = fs::read_to_string(&env_file).context("Failed to read .env file")?;

        let mut config = HashMap::new();
        let mut current_comment = None;

        for line in content.lines() {
            let line = line.trim();

            // Handle comments
            if line.starts_with('#') {
                current_comment = Some(line.trim_start_matches('#').trim().to_string());
                continue;
            }

            // Skip empty lines
            if line.is_empty() {
                current_comment = None;
                continue;
            }

            // Parse key=value
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_string();
                let value = value.trim().trim_matches('"').to_string();

                config.insert(
                    key.clone(),
                    ConfigValue {
                        key: key.clone(),
                        value,
                        comment: current_comment.take(),
                    },
                );
            }
        }

        Ok(Self { env_file, config })
    }

    /// Save configuration back to the .env file, preserving comments and order
    pub fn save(&self) -> Result<()> {
        let mut lines = Vec::new();
        let mut written: Vec<&str> = Vec::new();

        let original = fs::read_to_string(&self.env_file)?;
        for line in original.lines() {
            let line_trimmed = line.trim();

            if line_trimmed.starts_with('#') || line_trimmed.is_empty() {
                lines.push(line.to_string());
            } else if let Some((key, _)) = line_trimmed.split_once('=') {
                let key = key.trim();
                if let Some(value) = self.config.get(key) {
                    lines.push(format!("{}={}", key, value.value));
                    written.push(&value.key);
                } else {
                    lines.push(line.to_string());
                }
            }
        }

        // Keys added since the file was written
        for (key, value) in &self.config {
            if !written.contains(&key.as_str()) {
                lines.push(format!("{}={}", key, value.value));
            }
        }

        fs::write(&self.env_file, lines.join("\n") + "\n").context("Failed to write .env file")?;

        Ok(())
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(|v| v.value.as_str())
    }

    /// Set a configuration value
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();

        if let Some(existing) = self.config.get_mut(&key) {
            existing.value = value;
        } else {
            self.config.insert(
                key.clone(),
                ConfigValue {
                    key: key.clone(),
                    value,
                    comment: None,
                },
            );
        }
    }

    /// Get all configuration keys
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.config.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Where the Nextcloud database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    /// The `db` service of the managed compose stack.
    Managed,
    /// An external host reachable from this machine.
    External { host: String },
}

/// Which backup categories the encryption policy covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptSet {
    All,
    None,
    Categories(Vec<String>),
}

impl EncryptSet {
    /// Parse the BACKUP_GPG_ENCRYPT_TYPES value.
    ///
    /// Tokens are trimmed and empty tokens discarded, so `"db, ,secrets"`
    /// and `"db,secrets"` are equivalent.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "all" => EncryptSet::All,
            "none" | "" => EncryptSet::None,
            _ => EncryptSet::Categories(
                raw.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect(),
            ),
        }
    }

    pub fn contains(&self, category: &str) -> bool {
        match self {
            EncryptSet::All => true,
            EncryptSet::None => false,
            EncryptSet::Categories(cats) => cats.iter().any(|c| c == &category.to_lowercase()),
        }
    }
}

/// GPG encryption policy derived from configuration.
#[derive(Debug, Clone)]
pub struct GpgPolicy {
    pub enabled: bool,
    pub recipients: Vec<String>,
    pub include: EncryptSet,
    pub cipher: String,
    pub compress_level: u8,
    pub home_dir: Option<PathBuf>,
}

impl GpgPolicy {
    /// Pure policy decision: is this category encrypted?
    pub fn should_encrypt(&self, category: &str) -> bool {
        self.enabled && self.include.contains(category)
    }
}

/// Per-category retention windows in days.
#[derive(Debug, Clone, Copy)]
pub struct RetentionWindows {
    /// database, data and volume artifacts
    pub data_days: u32,
    /// config and log artifacts
    pub config_days: u32,
}

/// Immutable deployment settings, loaded once per invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub hostname: String,
    pub compose_project: String,
    pub database: DatabaseLocation,
    pub db_name: String,
    pub db_user: String,
    pub data_dir: PathBuf,
    pub secrets_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub gpg: GpgPolicy,
    pub retention: RetentionWindows,
}

impl Settings {
    /// Load and validate settings from a .env file.
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let config = ConfigManager::load(env_file)?;
        Self::from_config(&config)
    }

    pub fn from_config(config: &ConfigManager) -> Result<Self> {
        let get_or = |key: &str, default: &str| -> String {
            config.get(key).unwrap_or(default).to_string()
        };

        let database = match config.get("DB_HOST") {
            Some(host) if !host.is_empty() => DatabaseLocation::External {
                host: host.to_string(),
            },
            _ => DatabaseLocation::Managed,
        };

        let compress_level: u8 = get_or("BACKUP_GPG_COMPRESS_LEVEL", "6")
            .parse()
            .context("BACKUP_GPG_COMPRESS_LEVEL must be a number")?;
        if compress_level > 9 {
            return Err(anyhow!("BACKUP_GPG_COMPRESS_LEVEL must be 0-9"));
        }

        let gpg = GpgPolicy {
            enabled: matches!(
                get_or("BACKUP_GPG_ENCRYPTION", "false").to_lowercase().as_str(),
                "true" | "yes" | "1"
            ),
            recipients: parse_recipients(&get_or("BACKUP_GPG_RECIPIENTS", "")),
            include: EncryptSet::parse(&get_or("BACKUP_GPG_ENCRYPT_TYPES", "all")),
            cipher: get_or("BACKUP_GPG_CIPHER", "AES256"),
            compress_level,
            home_dir: config
                .get("BACKUP_GPG_HOME")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        };

        // Enabled encryption with nobody to encrypt to is a configuration
        // error, caught before any backup is attempted.
        if gpg.enabled && gpg.recipients.is_empty() {
            return Err(anyhow!(
                "BACKUP_GPG_ENCRYPTION is enabled but BACKUP_GPG_RECIPIENTS is empty"
            ));
        }

        let retention = RetentionWindows {
            data_days: get_or("BACKUP_RETENTION_DATA_DAYS", "14")
                .parse()
                .context("BACKUP_RETENTION_DATA_DAYS must be a number")?,
            config_days: get_or("BACKUP_RETENTION_CONFIG_DAYS", "30")
                .parse()
                .context("BACKUP_RETENTION_CONFIG_DAYS must be a number")?,
        };

        Ok(Settings {
            hostname: get_or("NEXTCLOUD_HOST", "localhost"),
            compose_project: get_or("COMPOSE_PROJECT_NAME", "nextcloud"),
            database,
            db_name: get_or("DB_NAME", "nextcloud"),
            db_user: get_or("DB_USER", "nextcloud"),
            data_dir: PathBuf::from(get_or("NEXTCLOUD_DATA_DIR", "./data")),
            secrets_dir: PathBuf::from(get_or("SECRETS_DIR", "./secrets")),
            backup_dir: PathBuf::from(get_or("BACKUP_DIR", "./backups")),
            gpg,
            retention,
        })
    }

    /// Validate settings beyond what loading already enforces.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.hostname.is_empty() {
            errors.push("NEXTCLOUD_HOST must not be empty".to_string());
        }
        if self.db_name.is_empty() {
            errors.push("DB_NAME must not be empty".to_string());
        }
        if !self.data_dir.is_dir() {
            errors.push(format!(
                "NEXTCLOUD_DATA_DIR does not exist: {}",
                self.data_dir.display()
            ));
        }
        if self.gpg.enabled && self.gpg.recipients.is_empty() {
            errors.push("GPG encryption enabled without recipients".to_string());
        }

        errors
    }

    /// Resolve relative directories against the deployment root.
    pub fn resolved_against(mut self, root: &Path) -> Self {
        for dir in [&mut self.data_dir, &mut self.secrets_dir, &mut self.backup_dir] {
            if dir.is_relative() {
                let resolved = root.join(dir.as_path());
                *dir = resolved;
            }
        }
        self
    }

    /// Container name of a stack service, `{project}-{service}`.
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}", self.compose_project, service)
    }

    /// Compose-scoped name of a named volume, `{project}_{volume}`.
    pub fn volume_name(&self, volume: &str) -> String {
        format!("{}_{}", self.compose_project, volume)
    }
}

/// Split a comma-separated recipient list, trimming whitespace and
/// discarding empty tokens.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_env(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file
    }

    #[test]
    fn test_config_manager() {
        let file = write_env(&[
            "# Deployment configuration",
            "NEXTCLOUD_HOST=cloud.example.com",
            "DB_NAME=nextcloud",
        ]);

        let config = ConfigManager::load(file.path()).unwrap();
        assert_eq!(config.get("NEXTCLOUD_HOST"), Some("cloud.example.com"));
        assert_eq!(config.get("DB_NAME"), Some("nextcloud"));
        assert_eq!(config.get("MISSING"), None);
    }

    #[test]
    fn test_settings_defaults() {
        let file = write_env(&["NEXTCLOUD_HOST=cloud.example.com"]);
        let settings = Settings::load(file.path()).unwrap();

        assert_eq!(settings.database, DatabaseLocation::Managed);
        assert_eq!(settings.db_name, "nextcloud");
        assert!(!settings.gpg.enabled);
        assert_eq!(settings.retention.data_days, 14);
        assert_eq!(settings.retention.config_days, 30);
        assert_eq!(settings.container_name("db"), "nextcloud-db");
        assert_eq!(settings.volume_name("db_data"), "nextcloud_db_data");
    }

    #[test]
    fn test_external_database() {
        let file = write_env(&["DB_HOST=pg.internal"]);
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(
            settings.database,
            DatabaseLocation::External {
                host: "pg.internal".to_string()
            }
        );
    }

    #[test]
    fn test_encryption_enabled_without_recipients_fails() {
        let file = write_env(&["BACKUP_GPG_ENCRYPTION=true"]);
        assert!(Settings::load(file.path()).is_err());
    }

    #[test]
    fn test_recipient_parsing() {
        assert_eq!(
            parse_recipients("admin@example.com, 0xDEADBEEF ,,"),
            vec!["admin@example.com".to_string(), "0xDEADBEEF".to_string()]
        );
        assert!(parse_recipients("  ").is_empty());
    }

    #[test]
    fn test_encrypt_set() {
        assert_eq!(EncryptSet::parse("all"), EncryptSet::All);
        assert_eq!(EncryptSet::parse("none"), EncryptSet::None);
        assert!(EncryptSet::parse("database, secrets").contains("database"));
        assert!(!EncryptSet::parse("database, secrets").contains("data"));
    }

    #[test]
    fn test_should_encrypt_policy() {
        let policy = |enabled: bool, types: &str| GpgPolicy {
            enabled,
            recipients: vec!["admin@example.com".to_string()],
            include: EncryptSet::parse(types),
            cipher: "AES256".to_string(),
            compress_level: 6,
            home_dir: None,
        };

        assert!(!policy(false, "all").should_encrypt("database"));
        assert!(policy(true, "all").should_encrypt("database"));
        assert!(!policy(true, "none").should_encrypt("database"));
        assert!(policy(true, "db,secrets").should_encrypt("db"));
        assert!(!policy(true, "db,secrets").should_encrypt("data"));
    }
}
