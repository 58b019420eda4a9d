/// Backup orchestrator
///
/// One operation per category (database, data, config, volumes, logs)
/// plus a full run that executes all of them in that fixed order and
/// keeps going past individual failures, reporting an aggregate at the
/// end. Artifacts are handed to the GPG engine according to the
/// per-category policy.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::core::artifact::{self, artifact_filename, now_stamp, Category};
use crate::core::config::{DatabaseLocation, Settings};
use crate::core::crypto::{decrypt_helper_script, GpgEngine};
use crate::core::docker::DockerManager;
use crate::core::occ::Occ;
use crate::core::secrets::SecretsStore;
use crate::utils::constants::{BACKUP_VOLUMES, DEFAULT_COMPOSE_FILE, DEFAULT_ENV_FILE, SERVICES};
use crate::utils::helpers::{dir_size, format_bytes};
use crate::utils::status;

/// Policy category used for individual secret files inside config bundles.
const SECRETS_CATEGORY: &str = "secrets";

const LOG_TAIL_LINES: usize = 1000;

pub struct BackupManager<'a> {
    settings: &'a Settings,
    docker: &'a DockerManager,
    gpg: GpgEngine,
}

impl<'a> BackupManager<'a> {
    pub fn new(settings: &'a Settings, docker: &'a DockerManager) -> Self {
        Self {
            settings,
            docker,
            gpg: GpgEngine::new(settings.gpg.clone()),
        }
    }

    fn backup_dir(&self) -> &Path {
        &self.settings.backup_dir
    }

    fn prepare_backup_dir(&self) -> Result<()> {
        fs::create_dir_all(self.backup_dir()).with_context(|| {
            format!("Failed to create backup dir {}", self.backup_dir().display())
        })
    }

    /// Apply the encryption policy to a finished artifact. Returns the
    /// final path. A failed encryption is a failed backup.
    fn seal(&self, category: &str, path: PathBuf) -> Result<PathBuf> {
        if !self.settings.gpg.should_encrypt(category) {
            return Ok(path);
        }
        let sealed = self.gpg.encrypt_file(&path)?;
        status::info(&format!(
            "Encrypted {} for {} recipient(s)",
            sealed.file_name().unwrap_or_default().to_string_lossy(),
            self.settings.gpg.recipients.len()
        ));
        Ok(sealed)
    }

    /// Run every category in fixed order; report per-category results and
    /// an aggregate error listing the failures.
    pub async fn backup_full(&self) -> Result<()> {
        let mut failed: Vec<(Category, anyhow::Error)> = Vec::new();

        for &category in Category::ALL {
            status::info(&format!("Starting {} backup", category));
            let result = match category {
                Category::Database => self.backup_database().await.map(|_| ()),
                Category::Data => self.backup_data().await.map(|_| ()),
                Category::Config => self.backup_config().await.map(|_| ()),
                Category::Volumes => self.backup_volumes().await.map(|_| ()),
                Category::Logs => self.backup_logs().await.map(|_| ()),
            };

            match result {
                Ok(()) => status::success(&format!("{} backup complete", category)),
                Err(e) => {
                    status::error(&format!("{} backup failed: {e:#}", category));
                    failed.push((category, e));
                }
            }
        }

        if failed.is_empty() {
            status::success("Full backup complete");
            Ok(())
        } else {
            bail!(
                "{}/{} categories failed: {}",
                failed.len(),
                Category::ALL.len(),
                failed
                    .iter()
                    .map(|(c, _)| c.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    }

    /// Dump the database, streaming through gzip straight into the
    /// artifact. A dump that exits non-zero never leaves a partial file
    /// behind pretending to be a backup.
    pub async fn backup_database(&self) -> Result<PathBuf> {
        self.prepare_backup_dir()?;

        let filename = artifact_filename(Category::Database, &self.settings.db_name, now_stamp());
        let path = self.backup_dir().join(filename);

        match &self.settings.database {
            DatabaseLocation::Managed => {
                status::info(&format!(
                    "Dumping database '{}' from the db container",
                    self.settings.db_name
                ));
                self.docker.exec_to_gzip(
                    "db",
                    &["pg_dump", "-U", &self.settings.db_user, &self.settings.db_name],
                    &path,
                )?;
            }
            DatabaseLocation::External { host } => {
                status::info(&format!(
                    "Dumping database '{}' from external host {}",
                    self.settings.db_name, host
                ));
                self.dump_external(host, &path)?;
            }
        }

        self.seal(Category::Database.prefix(), path)
    }

    fn dump_external(&self, host: &str, dest: &Path) -> Result<()> {
        let secrets = SecretsStore::new(&self.settings.secrets_dir);
        let password = secrets.read("postgres_password")?;

        let run = || -> Result<()> {
            let mut child = Command::new("pg_dump")
                .arg("-h")
                .arg(host)
                .arg("-U")
                .arg(&self.settings.db_user)
                .arg(&self.settings.db_name)
                .env("PGPASSWORD", &password)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .context("Failed to run pg_dump (is it installed?)")?;

            let stdout = child.stdout.take().expect("stdout piped");
            let mut reader = BufReader::new(stdout);

            let dest_file = File::create(dest)?;
            let mut encoder = GzEncoder::new(dest_file, Compression::new(6));
            std::io::copy(&mut reader, &mut encoder).context("Dump stream interrupted")?;
            encoder.finish()?;

            let result = child.wait()?;
            if !result.success() {
                bail!("pg_dump exited with {}", result);
            }
            Ok(())
        };

        run().inspect_err(|_| {
            let _ = fs::remove_file(dest);
        })
    }

    /// Archive the data directory inside a maintenance-mode window.
    ///
    /// A failed maintenance toggle downgrades consistency, not the backup
    /// itself: the archive still proceeds and the operator is warned.
    pub async fn backup_data(&self) -> Result<PathBuf> {
        self.prepare_backup_dir()?;

        let data_dir = &self.settings.data_dir;
        if !data_dir.is_dir() {
            bail!("data directory {} does not exist", data_dir.display());
        }

        self.preflight_disk_space(data_dir);

        let occ = Occ::new(self.docker);
        let maintenance_on = match occ.set_maintenance(true).await {
            Ok(()) => true,
            Err(e) => {
                status::warn(&format!(
                    "Could not enable maintenance mode ({e:#}); archive may not be fully consistent"
                ));
                false
            }
        };

        let filename = artifact_filename(Category::Data, "files", now_stamp());
        let path = self.backup_dir().join(filename);
        let archived = archive_directory(data_dir, &path);

        if maintenance_on {
            if let Err(e) = occ.set_maintenance(false).await {
                status::warn(&format!("Could not disable maintenance mode: {e:#}"));
            }
        }

        archived?;
        self.seal(Category::Data.prefix(), path)
    }

    /// Bundle in-container configuration, compose/env files and the
    /// secrets store. Secrets follow the policy engine individually.
    pub async fn backup_config(&self) -> Result<PathBuf> {
        self.prepare_backup_dir()?;

        let stamp = now_stamp();
        let staging = self
            .backup_dir()
            .join(format!(".staging-config-{}", stamp.format(artifact::TIMESTAMP_FORMAT)));
        fs::create_dir_all(&staging)?;

        let result = self.assemble_config_bundle(&staging, stamp).await;
        let _ = fs::remove_dir_all(&staging);
        result
    }

    async fn assemble_config_bundle(
        &self,
        staging: &Path,
        stamp: chrono::NaiveDateTime,
    ) -> Result<PathBuf> {
        // On-disk deployment files
        for file in [DEFAULT_COMPOSE_FILE, DEFAULT_ENV_FILE] {
            let src = self.docker.project_root().join(file);
            if src.exists() {
                fs::copy(&src, staging.join(file))?;
            } else {
                status::warn(&format!("{} not found, skipping", src.display()));
            }
        }

        // In-container application config
        let app_config = staging.join("config.php");
        if let Err(e) = self
            .docker
            .copy_from("app", "/var/www/html/config/config.php", &app_config)
        {
            status::warn(&format!("Could not copy config.php from app container: {e:#}"));
        }

        // Secrets, each following the policy for the secrets category
        let secrets = SecretsStore::new(&self.settings.secrets_dir);
        let secret_files = secrets.existing_files();
        if !secret_files.is_empty() {
            let secrets_dir = staging.join("secrets");
            fs::create_dir_all(&secrets_dir)?;

            if self.settings.gpg.should_encrypt(SECRETS_CATEGORY) {
                for file in &secret_files {
                    let copied = secrets_dir.join(file.file_name().unwrap_or_default());
                    fs::copy(file, &copied)?;
                    self.gpg.encrypt_file(&copied)?;
                }
                let helper = secrets_dir.join("decrypt.sh");
                fs::write(&helper, decrypt_helper_script())?;
                make_executable(&helper)?;
                fs::write(
                    secrets_dir.join("README.txt"),
                    format!(
                        "Secrets in this bundle are GPG-encrypted.\n\
                         Required private key(s): {}\n\
                         Run ./decrypt.sh with the matching keyring available.\n",
                        self.settings.gpg.recipients.join(", ")
                    ),
                )?;
            } else {
                status::warn("Secrets are included in PLAINTEXT:");
                for file in &secret_files {
                    status::warn(&format!(
                        "  {}",
                        file.file_name().unwrap_or_default().to_string_lossy()
                    ));
                    fs::copy(file, secrets_dir.join(file.file_name().unwrap_or_default()))?;
                }
            }
        }

        let filename = artifact_filename(Category::Config, "bundle", stamp);
        let path = self.backup_dir().join(filename);
        archive_directory(staging, &path)?;

        self.seal(Category::Config.prefix(), path)
    }

    /// Archive each named volume through a throwaway container.
    /// Missing volumes are warnings, not failures.
    pub async fn backup_volumes(&self) -> Result<Vec<PathBuf>> {
        self.prepare_backup_dir()?;

        let mut created = Vec::new();
        for volume in BACKUP_VOLUMES {
            let full_name = self.settings.volume_name(volume);
            if !self.docker.volume_exists(&full_name)? {
                status::warn(&format!("Volume {} does not exist, skipping", full_name));
                continue;
            }

            let filename = artifact_filename(Category::Volumes, volume, now_stamp());
            status::info(&format!("Archiving volume {}", full_name));
            self.docker
                .archive_volume(&full_name, self.backup_dir(), &filename)?;

            let path = self.seal(Category::Volumes.prefix(), self.backup_dir().join(filename))?;
            created.push(path);
        }

        Ok(created)
    }

    /// Capture recent logs per service into one bundle. The per-service
    /// plaintext files never outlive the run.
    pub async fn backup_logs(&self) -> Result<PathBuf> {
        self.prepare_backup_dir()?;

        let stamp = now_stamp();
        let staging = self
            .backup_dir()
            .join(format!(".staging-logs-{}", stamp.format(artifact::TIMESTAMP_FORMAT)));
        fs::create_dir_all(&staging)?;

        for service in SERVICES {
            match self.docker.logs(service.name, LOG_TAIL_LINES) {
                Ok(logs) => {
                    fs::write(staging.join(format!("{}.log", service.name)), logs)?;
                }
                Err(e) => {
                    status::warn(&format!("Could not capture {} logs: {e:#}", service.name));
                }
            }
        }

        let filename = artifact_filename(Category::Logs, "services", stamp);
        let path = self.backup_dir().join(filename);
        let archived = archive_directory(&staging, &path);

        // No orphaned plaintext log directory, success or not
        let _ = fs::remove_dir_all(&staging);
        archived?;

        self.seal(Category::Logs.prefix(), path)
    }

    /// Delete artifacts past their category's retention window.
    pub fn cleanup(&self) -> Result<()> {
        let deleted = artifact::cleanup(
            self.backup_dir(),
            &self.settings.retention,
            now_stamp(),
        )?;

        if deleted.is_empty() {
            status::info("No artifacts past retention");
        } else {
            for artifact in &deleted {
                status::info(&format!(
                    "Deleted {}",
                    artifact.path.file_name().unwrap_or_default().to_string_lossy()
                ));
            }
            status::success(&format!("Removed {} artifact(s)", deleted.len()));
        }
        Ok(())
    }

    /// Warn when the backup filesystem has less free space than the data
    /// directory currently occupies.
    fn preflight_disk_space(&self, data_dir: &Path) {
        use sysinfo::Disks;

        let needed = dir_size(data_dir);
        let disks = Disks::new_with_refreshed_list();
        let backup_dir = self
            .backup_dir()
            .canonicalize()
            .unwrap_or_else(|_| self.backup_dir().to_path_buf());

        // Longest mount point containing the backup dir wins
        let free = disks
            .iter()
            .filter(|d| backup_dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space());

        if let Some(free) = free {
            if free < needed {
                status::warn(&format!(
                    "Backup filesystem has {} free but the data directory holds {}",
                    format_bytes(free),
                    format_bytes(needed)
                ));
            }
        }
    }
}

/// tar.gz a directory's contents (no leading path components).
pub fn archive_directory(src: &Path, dest: &Path) -> Result<()> {
    let run = || -> Result<()> {
        let file = File::create(dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let encoder = GzEncoder::new(file, Compression::new(6));
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", src)
            .with_context(|| format!("Failed to archive {}", src.display()))?;
        let encoder = builder.into_inner()?;
        encoder.finish()?;
        Ok(())
    };

    run().inspect_err(|_| {
        let _ = fs::remove_file(dest);
    })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn test_archive_directory_round_trip() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("config.php"), b"<?php").unwrap();
        fs::create_dir(src.path().join("nested")).unwrap();
        fs::write(src.path().join("nested/file"), b"contents").unwrap();

        let dest_dir = tempfile::tempdir().unwrap();
        let dest = dest_dir.path().join("bundle.tar.gz");
        archive_directory(src.path(), &dest).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(File::open(&dest).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();

        assert!(names.iter().any(|n| n.ends_with("config.php")));
        assert!(names.iter().any(|n| n.ends_with("nested/file")));
    }

    #[test]
    fn test_archive_missing_directory_leaves_no_partial() {
        let dest_dir = tempfile::tempdir().unwrap();
        let dest = dest_dir.path().join("bundle.tar.gz");
        let missing = dest_dir.path().join("does-not-exist");

        assert!(archive_directory(&missing, &dest).is_err());
        assert!(!dest.exists());
    }
}
