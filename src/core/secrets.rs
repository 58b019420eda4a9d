/// Secrets store
///
/// One credential per file under a directory restricted to the owner
/// (mode 700 directory, 600 files). The container runtime mounts these as
/// Docker secrets; backup and restore read them through this module.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::constants::SECRET_NAMES;
use crate::utils::helpers::{generate_password, mask_sensitive};
use crate::utils::prompt::Prompt;
use crate::utils::status;

const SECRET_LENGTH: usize = 25;

pub struct SecretsStore {
    dir: PathBuf,
}

impl SecretsStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create the directory and generate any missing secrets.
    ///
    /// Existing secret files are left untouched.
    pub fn init(&self) -> Result<Vec<String>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create secrets dir {}", self.dir.display()))?;
        restrict_dir(&self.dir)?;

        let mut created = Vec::new();
        for name in SECRET_NAMES {
            let path = self.path(name);
            if path.exists() {
                continue;
            }
            self.write_secret(&path, &generate_password(SECRET_LENGTH))?;
            created.push(name.to_string());
        }

        Ok(created)
    }

    /// Read a secret value (trimmed single line).
    pub fn read(&self, name: &str) -> Result<String> {
        let path = self.path(name);
        let value = fs::read_to_string(&path).with_context(|| {
            format!(
                "Secret '{}' not found at {} (run 'secrets init' first?)",
                name,
                path.display()
            )
        })?;

        let value = value.trim().to_string();
        if value.is_empty() {
            return Err(anyhow!("Secret file {} is empty", path.display()));
        }
        Ok(value)
    }

    /// Regenerate one secret, after explicit confirmation.
    pub fn rotate(&self, name: &str, prompt: &dyn Prompt) -> Result<bool> {
        if !SECRET_NAMES.contains(&name) {
            return Err(anyhow!(
                "Unknown secret '{}' (known: {})",
                name,
                SECRET_NAMES.join(", ")
            ));
        }

        let path = self.path(name);
        if path.exists()
            && !prompt.confirm(
                &format!("Overwrite existing secret '{}'", name),
                false,
            )
        {
            return Ok(false);
        }

        fs::create_dir_all(&self.dir)?;
        restrict_dir(&self.dir)?;
        self.write_secret(&path, &generate_password(SECRET_LENGTH))?;
        status::warn("Dependent containers must be recreated to pick up the new value");
        Ok(true)
    }

    /// Secret names with masked previews. Full values are never printed.
    pub fn list(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        for name in SECRET_NAMES {
            let preview = match self.read(name) {
                Ok(value) => mask_sensitive(&value, 3),
                Err(_) => "<not set>".to_string(),
            };
            entries.push((name.to_string(), preview));
        }
        Ok(entries)
    }

    /// Paths of all existing secret files, for the config backup bundle.
    pub fn existing_files(&self) -> Vec<PathBuf> {
        SECRET_NAMES
            .iter()
            .map(|n| self.path(n))
            .filter(|p| p.exists())
            .collect()
    }

    fn write_secret(&self, path: &Path, value: &str) -> Result<()> {
        fs::write(path, format!("{}\n", value))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        restrict_file(path)?;
        Ok(())
    }
}

/// Write a secret value to an arbitrary path with owner-only permissions.
/// Used by config restore when copying secrets out of a bundle.
pub fn write_restricted(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    restrict_file(path)
}

#[cfg(unix)]
fn restrict_dir(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Failed to chmod 700 {}", path.display()))
}

#[cfg(unix)]
fn restrict_file(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to chmod 600 {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn restrict_file(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::prompt::ScriptedPrompt;

    #[test]
    fn test_init_creates_all_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::new(dir.path().join("secrets"));

        let created = store.init().unwrap();
        assert_eq!(created.len(), SECRET_NAMES.len());

        for name in SECRET_NAMES {
            let value = store.read(name).unwrap();
            assert_eq!(value.len(), SECRET_LENGTH);
        }

        // Second init is a no-op
        assert!(store.init().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::new(dir.path().join("secrets"));
        store.init().unwrap();

        let dir_mode = fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);

        let file_mode = fs::metadata(store.path("postgres_password"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
    }

    #[test]
    fn test_read_missing_secret_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::new(dir.path());
        assert!(store.read("postgres_password").is_err());
    }

    #[test]
    fn test_rotate_requires_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::new(dir.path().join("secrets"));
        store.init().unwrap();

        let before = store.read("postgres_password").unwrap();

        let declined = ScriptedPrompt {
            confirm_answer: false,
            selection: None,
        };
        assert!(!store.rotate("postgres_password", &declined).unwrap());
        assert_eq!(store.read("postgres_password").unwrap(), before);

        let confirmed = ScriptedPrompt {
            confirm_answer: true,
            selection: None,
        };
        assert!(store.rotate("postgres_password", &confirmed).unwrap());
        assert_ne!(store.read("postgres_password").unwrap(), before);
    }

    #[test]
    fn test_rotate_unknown_secret() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretsStore::new(dir.path());
        let prompt = ScriptedPrompt {
            confirm_answer: true,
            selection: None,
        };
        assert!(store.rotate("nonexistent", &prompt).is_err());
    }
}
