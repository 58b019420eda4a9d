/// Restore orchestrator
///
/// Inverse of the backup orchestrator. Every operation selects an
/// artifact, decrypts it to a staging area when needed, confirms the
/// destructive step with the operator, restores, then runs the
/// post-restore repair commands inside the app container. Unlike backup,
/// the full composite aborts on the first failed category: later steps
/// assume earlier ones succeeded.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::core::artifact::{self, Artifact, Category, TIMESTAMP_FORMAT};
use crate::core::config::{DatabaseLocation, Settings};
use crate::core::crypto::{is_encrypted_artifact, GpgEngine};
use crate::core::docker::{ContainerRuntime, DockerManager};
use crate::core::occ::Occ;
use crate::core::secrets;
use crate::core::secrets::SecretsStore;
use crate::utils::constants::{volume_services, DB_DEPENDENT_SERVICES, DEFAULT_COMPOSE_FILE, DEFAULT_ENV_FILE};
use crate::utils::prompt::Prompt;
use crate::utils::status;

pub struct RestoreManager<'a> {
    settings: &'a Settings,
    docker: &'a DockerManager,
    gpg: GpgEngine,
    prompt: &'a dyn Prompt,
}

impl<'a> RestoreManager<'a> {
    pub fn new(settings: &'a Settings, docker: &'a DockerManager, prompt: &'a dyn Prompt) -> Self {
        Self {
            settings,
            docker,
            gpg: GpgEngine::new(settings.gpg.clone()),
            prompt,
        }
    }

    /// Pick an artifact of the category: by exact timestamp when given,
    /// interactively otherwise.
    fn select_artifact(&self, category: Category, timestamp: Option<&str>) -> Result<Artifact> {
        let candidates = artifact::list_category(&self.settings.backup_dir, category)?;
        if candidates.is_empty() {
            bail!(
                "no {} backups found in {}",
                category,
                self.settings.backup_dir.display()
            );
        }

        if let Some(stamp) = timestamp {
            let wanted = chrono::NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
                .with_context(|| format!("invalid timestamp '{}' (expected YYYYMMDD_HHMMSS)", stamp))?;
            return candidates
                .into_iter()
                .find(|a| a.timestamp == wanted)
                .ok_or_else(|| anyhow!("no {} backup with timestamp {}", category, stamp));
        }

        let labels: Vec<String> = candidates
            .iter()
            .map(|a| {
                format!(
                    "{} ({}{})",
                    a.path.file_name().unwrap_or_default().to_string_lossy(),
                    crate::utils::helpers::format_bytes(a.size),
                    if a.encrypted { ", encrypted" } else { "" }
                )
            })
            .collect();
        let index = self
            .prompt
            .select(&format!("Available {} backups:", category), &labels)
            .ok_or_else(|| anyhow!("no backup selected"))?;
        Ok(candidates.into_iter().nth(index).expect("selected index in range"))
    }

    /// Decrypt into a staging directory when the artifact is encrypted.
    /// Returns the plaintext path and the staging dir to clean up.
    fn stage_plaintext(&self, artifact: &Artifact) -> Result<(PathBuf, Option<PathBuf>)> {
        if !artifact.encrypted && !is_encrypted_artifact(&artifact.path, self.prompt)? {
            return Ok((artifact.path.clone(), None));
        }

        let staging = self.settings.backup_dir.join(format!(
            ".staging-restore-{}",
            artifact.timestamp.format(TIMESTAMP_FORMAT)
        ));
        fs::create_dir_all(&staging)?;

        let output = staging.join(
            crate::core::crypto::derive_plaintext_path(&artifact.path)
                .file_name()
                .unwrap_or_default(),
        );
        let plaintext = self
            .gpg
            .decrypt_file(&artifact.path, Some(&output), self.prompt)
            .map_err(|e| anyhow!("decryption failed: {e}"))?;
        Ok((plaintext, Some(staging)))
    }

    /// Full restore: database, then data, then config. Aborts on the
    /// first failure.
    pub async fn restore_full(&self) -> Result<()> {
        self.restore_database(None).await?;
        self.restore_data(None).await?;
        self.restore_config(None).await?;
        status::success("Full restore complete");
        Ok(())
    }

    /// Drop and rebuild the database from a dump.
    pub async fn restore_database(&self, timestamp: Option<&str>) -> Result<()> {
        let selected = self.select_artifact(Category::Database, timestamp)?;
        let (dump, staging) = self.stage_plaintext(&selected)?;

        let result = self.restore_database_inner(&dump).await;
        if let Some(staging) = staging {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    async fn restore_database_inner(&self, dump: &Path) -> Result<()> {
        if !self.prompt.confirm(
            &format!(
                "This will DROP and recreate database '{}'. Continue",
                self.settings.db_name
            ),
            false,
        ) {
            bail!("aborted by operator");
        }

        let occ = Occ::new(self.docker);

        // Everything up to the drop must leave the stack untouched on
        // failure.
        occ.set_maintenance(true)
            .await
            .context("could not enable maintenance mode")?;

        let mut stopped: Vec<&str> = Vec::new();
        let mut stop_err: Option<anyhow::Error> = None;
        for service in DB_DEPENDENT_SERVICES {
            match self.docker.stop_service(service).await {
                Ok(()) => stopped.push(service),
                Err(e) => {
                    stop_err = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = stop_err {
            self.restart_services(&stopped).await;
            let _ = occ.set_maintenance(false).await;
            return Err(e.context("failed to stop dependent services"));
        }

        // Destructive section: from here on, services are restarted even
        // when a step fails.
        let destructive = self.drop_and_load(dump).await;

        self.restart_services(DB_DEPENDENT_SERVICES).await;

        match destructive {
            Ok(()) => {
                if let Err(e) = occ.add_missing_indices().await {
                    status::warn(&format!("db:add-missing-indices failed: {e:#}"));
                }
                if let Err(e) = occ.maintenance_repair().await {
                    status::warn(&format!("maintenance:repair failed: {e:#}"));
                }
                if let Err(e) = occ.set_maintenance(false).await {
                    status::warn(&format!("could not disable maintenance mode: {e:#}"));
                }
                status::success("Database restore complete");
                Ok(())
            }
            Err(e) => {
                let _ = occ.set_maintenance(false).await;
                Err(e)
            }
        }
    }

    async fn drop_and_load(&self, dump: &Path) -> Result<()> {
        let db = &self.settings.db_name;
        let user = &self.settings.db_user;
        let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\"", db);
        let create_sql = format!("CREATE DATABASE \"{}\" OWNER \"{}\"", db, user);

        match &self.settings.database {
            DatabaseLocation::Managed => {
                status::info(&format!("Recreating database '{}'", db));
                self.docker
                    .exec("db", None, &["psql", "-U", user, "-d", "postgres", "-c", &drop_sql])
                    .await?;
                self.docker
                    .exec("db", None, &["psql", "-U", user, "-d", "postgres", "-c", &create_sql])
                    .await?;

                status::info("Loading dump");
                self.docker
                    .exec_from_gzip("db", &["psql", "-U", user, "-d", db, "-q"], dump)
            }
            DatabaseLocation::External { host } => {
                self.load_external(host, dump, &drop_sql, &create_sql)
            }
        }
    }

    fn load_external(&self, host: &str, dump: &Path, drop_sql: &str, create_sql: &str) -> Result<()> {
        use std::io;
        use std::process::{Command, Stdio};

        let store = SecretsStore::new(&self.settings.secrets_dir);
        let password = store.read("postgres_password")?;
        let user = &self.settings.db_user;

        let psql = |db: &str, sql: Option<&str>, stdin_from: Option<&Path>| -> Result<()> {
            let mut cmd = Command::new("psql");
            cmd.arg("-h")
                .arg(host)
                .arg("-U")
                .arg(user)
                .arg("-d")
                .arg(db)
                .env("PGPASSWORD", &password)
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            if let Some(sql) = sql {
                cmd.arg("-c").arg(sql);
            }

            if let Some(path) = stdin_from {
                cmd.stdin(Stdio::piped());
                let mut child = cmd.spawn().context("Failed to run psql (is it installed?)")?;
                {
                    let mut stdin = child.stdin.take().expect("stdin piped");
                    let file = File::open(path)?;
                    let mut decoder = GzDecoder::new(file);
                    io::copy(&mut decoder, &mut stdin)?;
                }
                let result = child.wait()?;
                if !result.success() {
                    bail!("psql exited with {}", result);
                }
            } else {
                let output = cmd.output().context("Failed to run psql (is it installed?)")?;
                if !output.status.success() {
                    bail!("psql failed: {}", String::from_utf8_lossy(&output.stderr).trim());
                }
            }
            Ok(())
        };

        status::info(&format!("Recreating database '{}' on {}", self.settings.db_name, host));
        psql("postgres", Some(drop_sql), None)?;
        psql("postgres", Some(create_sql), None)?;
        status::info("Loading dump");
        psql(&self.settings.db_name, None, Some(dump))
    }

    async fn restart_services(&self, services: &[&str]) {
        for service in services {
            if let Err(e) = self.docker.up_service(service).await {
                status::error(&format!(
                    "could not restart {} after restore: {e:#} (manual intervention required)",
                    service
                ));
            }
        }
    }

    /// Replace the live data directory, keeping the previous tree as a
    /// timestamped sibling until the operator lets it go.
    pub async fn restore_data(&self, timestamp: Option<&str>) -> Result<()> {
        let selected = self.select_artifact(Category::Data, timestamp)?;
        let (archive, staging) = self.stage_plaintext(&selected)?;

        let result = self.restore_data_inner(&selected, &archive).await;
        if let Some(staging) = staging {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    async fn restore_data_inner(&self, selected: &Artifact, archive: &Path) -> Result<()> {
        let data_dir = &self.settings.data_dir;
        if !self.prompt.confirm(
            &format!(
                "This will replace the data directory {} with backup {}. Continue",
                data_dir.display(),
                selected.timestamp.format(TIMESTAMP_FORMAT)
            ),
            false,
        ) {
            bail!("aborted by operator");
        }

        let occ = Occ::new(self.docker);
        let maintenance_on = occ.set_maintenance(true).await.is_ok();
        if !maintenance_on {
            status::warn("Could not enable maintenance mode; continuing");
        }

        let replaced = replace_dir_from_archive(data_dir, archive, &selected.timestamp);

        if maintenance_on {
            if let Err(e) = occ.set_maintenance(false).await {
                status::warn(&format!("could not disable maintenance mode: {e:#}"));
            }
        }

        let aside = replaced?;

        if let Err(e) = occ.files_scan_all().await {
            status::warn(&format!("files:scan failed: {e:#}"));
        }

        if self
            .prompt
            .confirm(&format!("Delete previous data at {}", aside.display()), false)
        {
            fs::remove_dir_all(&aside)
                .with_context(|| format!("Failed to delete {}", aside.display()))?;
            status::info("Previous data directory deleted");
        } else {
            status::info(&format!("Previous data kept at {}", aside.display()));
        }

        status::success("Data restore complete");
        Ok(())
    }

    /// Restore files from a config bundle, selectively and never
    /// overwriting without per-file confirmation.
    pub async fn restore_config(&self, timestamp: Option<&str>) -> Result<()> {
        let selected = self.select_artifact(Category::Config, timestamp)?;
        let (archive, staging) = self.stage_plaintext(&selected)?;

        let extract_dir = self.settings.backup_dir.join(format!(
            ".staging-config-restore-{}",
            selected.timestamp.format(TIMESTAMP_FORMAT)
        ));
        let result = self.restore_config_inner(&archive, &extract_dir).await;

        let _ = fs::remove_dir_all(&extract_dir);
        if let Some(staging) = staging {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    async fn restore_config_inner(&self, archive: &Path, extract_dir: &Path) -> Result<()> {
        extract_archive(archive, extract_dir)?;

        let restore_all = self
            .prompt
            .confirm("Restore ALL files from the bundle", false);

        // Deployment files back beside the compose file
        for file in [DEFAULT_COMPOSE_FILE, DEFAULT_ENV_FILE] {
            let src = extract_dir.join(file);
            if !src.exists() {
                continue;
            }
            if !restore_all && !self.prompt.confirm(&format!("Restore {}", file), false) {
                continue;
            }
            let dest = self.docker.project_root().join(file);
            if dest.exists()
                && !self
                    .prompt
                    .confirm(&format!("{} exists, overwrite", dest.display()), false)
            {
                status::info(&format!("Skipped {}", file));
                continue;
            }
            fs::copy(&src, &dest)?;
            status::success(&format!("Restored {}", file));
        }

        // Application config back into the container
        let app_config = extract_dir.join("config.php");
        if app_config.exists()
            && (restore_all || self.prompt.confirm("Restore config.php into the app container", false))
        {
            self.docker
                .copy_to("app", &app_config, "/var/www/html/config/config.php")?;
            status::success("Restored config.php");
        }

        // Secrets: decrypt wrapped ones, tighten permissions on all
        let bundled_secrets = extract_dir.join("secrets");
        if bundled_secrets.is_dir() {
            fs::create_dir_all(&self.settings.secrets_dir)?;
            for entry in fs::read_dir(&bundled_secrets)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name == "decrypt.sh" || name == "README.txt" {
                    continue;
                }

                if !restore_all && !self.prompt.confirm(&format!("Restore secret {}", name), false) {
                    continue;
                }

                let plaintext = if name.ends_with(".gpg") {
                    self.gpg
                        .decrypt_file(&entry.path(), None, self.prompt)
                        .map_err(|e| anyhow!("could not decrypt secret {}: {e}", name))?
                } else {
                    entry.path()
                };

                let dest_name = plaintext.file_name().unwrap_or_default().to_os_string();
                let dest = self.settings.secrets_dir.join(&dest_name);
                if dest.exists()
                    && !self
                        .prompt
                        .confirm(&format!("{} exists, overwrite", dest.display()), false)
                {
                    status::info(&format!("Skipped secret {}", dest_name.to_string_lossy()));
                    continue;
                }
                secrets::write_restricted(&dest, &fs::read(&plaintext)?)?;
                status::success(&format!("Restored secret {}", dest_name.to_string_lossy()));
            }
        }

        status::success("Config restore complete");
        Ok(())
    }

    /// Replace one named volume's contents from a volume backup.
    pub async fn restore_volume(&self, timestamp: Option<&str>) -> Result<()> {
        let selected = self.select_artifact(Category::Volumes, timestamp)?;
        let (archive, staging) = self.stage_plaintext(&selected)?;

        let result = self.restore_volume_inner(&selected, &archive).await;
        if let Some(staging) = staging {
            let _ = fs::remove_dir_all(&staging);
        }
        result
    }

    async fn restore_volume_inner(&self, selected: &Artifact, archive: &Path) -> Result<()> {
        // The volume is named in the artifact: volumes-{name}-{ts}.tar.gz
        let volume = selected.name.clone();
        let full_name = self.settings.volume_name(&volume);

        if !self.docker.volume_exists(&full_name)? {
            if !self
                .prompt
                .confirm(&format!("Volume {} does not exist, create it", full_name), false)
            {
                bail!("volume {} does not exist", full_name);
            }
            self.docker.create_volume(&full_name)?;
        }

        if !self.prompt.confirm(
            &format!("This will replace ALL content of volume {}. Continue", full_name),
            false,
        ) {
            bail!("aborted by operator");
        }

        let dependents = volume_services(&volume);
        for service in dependents {
            self.docker.stop_service(service).await?;
        }

        let result = self.docker.restore_volume(&full_name, archive);
        self.restart_services(dependents).await;
        result?;

        status::success(&format!("Volume {} restored", full_name));
        Ok(())
    }
}

/// Extract a tar.gz archive into a directory.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file =
        File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    fs::create_dir_all(dest)?;
    tar.unpack(dest)
        .with_context(|| format!("Failed to extract {}", archive.display()))
}

/// Move `dir` to a timestamped sibling, extract `archive` in its place.
/// On extraction failure the sibling is moved back before returning.
/// Returns the sibling path on success.
pub fn replace_dir_from_archive(
    dir: &Path,
    archive: &Path,
    stamp: &chrono::NaiveDateTime,
) -> Result<PathBuf> {
    let aside = dir.with_file_name(format!(
        "{}.pre-restore-{}",
        dir.file_name().unwrap_or_default().to_string_lossy(),
        stamp.format(TIMESTAMP_FORMAT)
    ));
    if aside.exists() {
        bail!("previous restore leftover {} is in the way", aside.display());
    }

    fs::rename(dir, &aside)
        .with_context(|| format!("Failed to move {} aside", dir.display()))?;

    match extract_archive(archive, dir) {
        Ok(()) => Ok(aside),
        Err(e) => {
            // Roll back: drop the partial tree, put the original back
            let _ = fs::remove_dir_all(dir);
            fs::rename(&aside, dir).with_context(|| {
                format!(
                    "FAILED to move {} back to {}; manual intervention required",
                    aside.display(),
                    dir.display()
                )
            })?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backup::archive_directory;
    use chrono::NaiveDateTime;

    fn stamp() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("20250315_120000", TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn test_replace_dir_success_keeps_sibling() {
        let root = tempfile::tempdir().unwrap();

        let content = root.path().join("content");
        fs::create_dir(&content).unwrap();
        fs::write(content.join("new.txt"), b"restored").unwrap();
        let archive = root.path().join("data-files-20250315_120000.tar.gz");
        archive_directory(&content, &archive).unwrap();

        let data = root.path().join("data");
        fs::create_dir(&data).unwrap();
        fs::write(data.join("old.txt"), b"live").unwrap();

        let aside = replace_dir_from_archive(&data, &archive, &stamp()).unwrap();

        assert!(data.join("new.txt").exists());
        assert!(!data.join("old.txt").exists());
        assert!(aside.join("old.txt").exists());
        assert_eq!(
            aside.file_name().unwrap().to_string_lossy(),
            "data.pre-restore-20250315_120000"
        );
    }

    #[test]
    fn test_replace_dir_failure_restores_original() {
        let root = tempfile::tempdir().unwrap();

        // Not a valid gzip stream
        let archive = root.path().join("data-files-20250315_120000.tar.gz");
        fs::write(&archive, b"definitely not a tarball").unwrap();

        let data = root.path().join("data");
        fs::create_dir(&data).unwrap();
        fs::write(data.join("old.txt"), b"live").unwrap();

        assert!(replace_dir_from_archive(&data, &archive, &stamp()).is_err());

        // Original tree intact at its original path, no sibling left
        assert!(data.join("old.txt").exists());
        assert!(!root.path().join("data.pre-restore-20250315_120000").exists());
    }

    #[test]
    fn test_extract_archive_round_trip() {
        let root = tempfile::tempdir().unwrap();

        let content = root.path().join("content");
        fs::create_dir(&content).unwrap();
        fs::write(content.join("a.txt"), b"alpha").unwrap();

        let archive = root.path().join("bundle.tar.gz");
        archive_directory(&content, &archive).unwrap();

        let out = root.path().join("out");
        extract_archive(&archive, &out).unwrap();
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
    }
}
