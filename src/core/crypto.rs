/// GPG encryption engine for backup artifacts
///
/// Policy decisions (which categories are encrypted, for whom) live in
/// `GpgPolicy`; this module wraps the gpg binary and guarantees the
/// one-file contract: after encryption exactly one file exists at the
/// declared output path, never plaintext and ciphertext side by side.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

use crate::core::config::GpgPolicy;
use crate::utils::prompt::Prompt;

/// Extension carried by every artifact this engine produces.
pub const GPG_EXT: &str = "gpg";

/// Why a decryption failed, to the extent gpg distinguishes them.
#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("no matching private key in the keyring")]
    NoSecretKey,
    #[error("wrong passphrase")]
    BadPassphrase,
    #[error("input is not valid OpenPGP data (corrupt or renamed plaintext?)")]
    CorruptInput,
    #[error("output {0} already exists")]
    OutputExists(PathBuf),
    #[error("gpg failed: {0}")]
    Other(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result of sniffing a file for encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMarker {
    Encrypted,
    Plaintext,
    /// Bit pattern could be OpenPGP but is not a known packet start.
    Ambiguous,
}

pub struct GpgEngine {
    policy: GpgPolicy,
}

impl GpgEngine {
    pub fn new(policy: GpgPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GpgPolicy {
        &self.policy
    }

    fn gpg(&self) -> Command {
        let mut cmd = Command::new("gpg");
        cmd.arg("--batch").arg("--yes").arg("--quiet");
        if let Some(home) = &self.policy.home_dir {
            cmd.arg("--homedir").arg(home);
        }
        cmd
    }

    /// Check the gpg binary is present and every recipient resolves to a
    /// public key. Run once before the first encrypting backup.
    pub fn verify_recipients(&self) -> Result<()> {
        if self.policy.recipients.is_empty() {
            bail!("encryption enabled but no recipients configured");
        }

        let mut missing = Vec::new();
        for recipient in &self.policy.recipients {
            let output = self
                .gpg()
                .arg("--list-keys")
                .arg(recipient)
                .output()
                .context("Failed to run gpg (is it installed?)")?;
            if !output.status.success() {
                missing.push(recipient.clone());
            }
        }

        if !missing.is_empty() {
            bail!(
                "no public key found for recipient(s): {}",
                missing.join(", ")
            );
        }
        Ok(())
    }

    /// Encrypt `input` in place, producing `{input}.gpg`.
    ///
    /// The ciphertext is written to a partial file first and only renamed
    /// over the declared output once gpg reports success, at which point
    /// the plaintext is removed. On failure the plaintext is untouched and
    /// no partial file is left behind.
    pub fn encrypt_file(&self, input: &Path) -> Result<PathBuf> {
        if self.policy.recipients.is_empty() {
            bail!("encryption requested but recipient list is empty");
        }

        let output = gpg_sibling(input);
        let partial = output.with_extension(format!("{}.part", GPG_EXT));

        let mut cmd = self.gpg();
        cmd.arg("--trust-model")
            .arg("always")
            .arg("--cipher-algo")
            .arg(&self.policy.cipher)
            .arg("--compress-level")
            .arg(self.policy.compress_level.to_string());
        for recipient in &self.policy.recipients {
            cmd.arg("--recipient").arg(recipient);
        }
        let result = cmd
            .arg("--output")
            .arg(&partial)
            .arg("--encrypt")
            .arg(input)
            .output()
            .context("Failed to run gpg (is it installed?)")?;

        if !result.status.success() {
            let _ = fs::remove_file(&partial);
            bail!(
                "gpg encryption of {} failed: {}",
                input.display(),
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }

        fs::rename(&partial, &output)
            .with_context(|| format!("Failed to move ciphertext to {}", output.display()))?;
        fs::remove_file(input)
            .with_context(|| format!("Failed to remove plaintext {}", input.display()))?;

        Ok(output)
    }

    /// Decrypt `input` to `output` (derived from the input name when not
    /// given). Never silently overwrites an existing output.
    pub fn decrypt_file(
        &self,
        input: &Path,
        output: Option<&Path>,
        prompt: &dyn Prompt,
    ) -> std::result::Result<PathBuf, DecryptError> {
        let output = match output {
            Some(p) => p.to_path_buf(),
            None => derive_plaintext_path(input),
        };

        let existed_before = output.exists();
        if existed_before
            && !prompt.confirm(
                &format!("Output {} exists, overwrite", output.display()),
                false,
            )
        {
            return Err(DecryptError::OutputExists(output));
        }

        let result = self
            .gpg()
            .arg("--output")
            .arg(&output)
            .arg("--decrypt")
            .arg(input)
            .output()?;

        if result.status.success() {
            return Ok(output);
        }

        // gpg may leave a zero-length output on failure
        if !existed_before {
            let _ = fs::remove_file(&output);
        }
        Err(classify_decrypt_failure(&String::from_utf8_lossy(
            &result.stderr,
        )))
    }
}

/// `{input}.gpg` beside the input file.
fn gpg_sibling(input: &Path) -> PathBuf {
    let mut name = input.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(GPG_EXT);
    input.with_file_name(name)
}

/// Strip a `.gpg` suffix, or append `.decrypted` for renamed files.
pub fn derive_plaintext_path(input: &Path) -> PathBuf {
    match input.extension() {
        Some(ext) if ext == GPG_EXT => input.with_extension(""),
        _ => {
            let mut name = input.file_name().unwrap_or_default().to_os_string();
            name.push(".decrypted");
            input.with_file_name(name)
        }
    }
}

/// Map gpg stderr to a failure class.
fn classify_decrypt_failure(stderr: &str) -> DecryptError {
    let lower = stderr.to_lowercase();
    if lower.contains("no secret key") {
        DecryptError::NoSecretKey
    } else if lower.contains("bad passphrase") || lower.contains("bad session key") {
        DecryptError::BadPassphrase
    } else if lower.contains("no valid openpgp data") || lower.contains("invalid packet") {
        DecryptError::CorruptInput
    } else {
        DecryptError::Other(stderr.trim().to_string())
    }
}

/// Sniff a file's encryption state.
///
/// The `.gpg` suffix is authoritative for artifacts we produced; content
/// sniffing is the fallback for externally renamed files.
pub fn detect_encryption(path: &Path) -> std::io::Result<EncryptionMarker> {
    if path.extension().is_some_and(|e| e == GPG_EXT) {
        return Ok(EncryptionMarker::Encrypted);
    }

    let mut header = [0u8; 2];
    let n = fs::File::open(path)?.read(&mut header)?;
    if n < 2 {
        return Ok(EncryptionMarker::Plaintext);
    }

    // gzip magic: every plaintext artifact we create is gzip-compressed
    if header == [0x1f, 0x8b] {
        return Ok(EncryptionMarker::Plaintext);
    }

    // OpenPGP packet starts: public-key (0x84/0x85, 0xc1) or symmetric
    // (0x8c, 0xc3) encrypted session key
    match header[0] {
        0x84 | 0x85 | 0xc1 | 0x8c | 0xc3 => Ok(EncryptionMarker::Encrypted),
        b if b & 0x80 != 0 => Ok(EncryptionMarker::Ambiguous),
        _ => Ok(EncryptionMarker::Plaintext),
    }
}

/// Convenience wrapper: does the file look like ciphertext?
pub fn looks_encrypted(path: &Path) -> bool {
    matches!(detect_encryption(path), Ok(EncryptionMarker::Encrypted))
}

/// Resolve a possibly-ambiguous file, asking the operator when sniffing
/// cannot decide.
pub fn is_encrypted_artifact(path: &Path, prompt: &dyn Prompt) -> Result<bool> {
    match detect_encryption(path).with_context(|| format!("Failed to read {}", path.display()))? {
        EncryptionMarker::Encrypted => Ok(true),
        EncryptionMarker::Plaintext => Ok(false),
        EncryptionMarker::Ambiguous => Ok(prompt.confirm(
            &format!(
                "{} is neither a known archive nor recognizable ciphertext; treat as encrypted",
                path.display()
            ),
            false,
        )),
    }
}

/// Self-contained helper script shipped next to GPG-wrapped secrets in
/// config bundles.
pub fn decrypt_helper_script() -> &'static str {
    "#!/bin/sh\n\
     # Decrypt all .gpg files in this directory with the local keyring.\n\
     set -eu\n\
     for f in *.gpg; do\n\
     \t[ -e \"$f\" ] || continue\n\
     \tgpg --batch --yes --output \"${f%.gpg}\" --decrypt \"$f\"\n\
     \techo \"decrypted ${f%.gpg}\"\n\
     done\n"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EncryptSet;
    use crate::utils::prompt::ScriptedPrompt;
    use std::io::Write;

    fn test_policy(home: Option<PathBuf>) -> GpgPolicy {
        GpgPolicy {
            enabled: true,
            recipients: vec!["backup@example.com".to_string()],
            include: EncryptSet::All,
            cipher: "AES256".to_string(),
            compress_level: 6,
            home_dir: home,
        }
    }

    #[test]
    fn test_derive_plaintext_path() {
        assert_eq!(
            derive_plaintext_path(Path::new("/b/database-nextcloud-20250101_000000.sql.gz.gpg")),
            PathBuf::from("/b/database-nextcloud-20250101_000000.sql.gz")
        );
        assert_eq!(
            derive_plaintext_path(Path::new("/b/renamed-artifact")),
            PathBuf::from("/b/renamed-artifact.decrypted")
        );
    }

    #[test]
    fn test_detect_encryption_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.tar.gz.gpg");
        std::fs::write(&path, b"anything").unwrap();
        assert_eq!(
            detect_encryption(&path).unwrap(),
            EncryptionMarker::Encrypted
        );
        assert!(looks_encrypted(&path));
    }

    #[test]
    fn test_detect_encryption_by_content() {
        let dir = tempfile::tempdir().unwrap();

        let gzip = dir.path().join("plain");
        std::fs::write(&gzip, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        assert_eq!(detect_encryption(&gzip).unwrap(), EncryptionMarker::Plaintext);

        let pgp = dir.path().join("renamed");
        std::fs::write(&pgp, [0x85, 0x01, 0x0c, 0x03]).unwrap();
        assert_eq!(detect_encryption(&pgp).unwrap(), EncryptionMarker::Encrypted);

        let odd = dir.path().join("odd");
        std::fs::write(&odd, [0xf0, 0x00]).unwrap();
        assert_eq!(detect_encryption(&odd).unwrap(), EncryptionMarker::Ambiguous);

        let text = dir.path().join("text.sql");
        std::fs::write(&text, b"SELECT 1;").unwrap();
        assert_eq!(detect_encryption(&text).unwrap(), EncryptionMarker::Plaintext);
    }

    #[test]
    fn test_classify_decrypt_failure() {
        assert!(matches!(
            classify_decrypt_failure("gpg: decryption failed: No secret key"),
            DecryptError::NoSecretKey
        ));
        assert!(matches!(
            classify_decrypt_failure("gpg: decryption failed: Bad session key"),
            DecryptError::BadPassphrase
        ));
        assert!(matches!(
            classify_decrypt_failure("gpg: no valid OpenPGP data found."),
            DecryptError::CorruptInput
        ));
        assert!(matches!(
            classify_decrypt_failure("gpg: something else"),
            DecryptError::Other(_)
        ));
    }

    /// Full round trip against a throwaway keyring. Skipped when gpg is
    /// not installed.
    #[test]
    fn test_encrypt_decrypt_round_trip() {
        if Command::new("gpg").arg("--version").output().is_err() {
            return;
        }

        let home = tempfile::tempdir().unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(home.path(), std::fs::Permissions::from_mode(0o700)).unwrap();
        }

        // Passphrase-less key so decryption needs no pinentry
        let keyspec = home.path().join("keyspec");
        std::fs::write(
            &keyspec,
            "%no-protection\n\
             Key-Type: RSA\n\
             Key-Length: 2048\n\
             Name-Real: Backup Test\n\
             Name-Email: backup@example.com\n\
             Expire-Date: 0\n\
             %commit\n",
        )
        .unwrap();
        let gen = Command::new("gpg")
            .arg("--homedir")
            .arg(home.path())
            .arg("--batch")
            .arg("--gen-key")
            .arg(&keyspec)
            .output()
            .unwrap();
        if !gen.status.success() {
            // Restricted environment without keygen support
            return;
        }

        let work = tempfile::tempdir().unwrap();
        let plain = work.path().join("database-nextcloud-20250101_000000.sql.gz");
        let mut f = std::fs::File::create(&plain).unwrap();
        f.write_all(b"\x1f\x8b fake dump contents").unwrap();
        drop(f);
        let original = std::fs::read(&plain).unwrap();

        let engine = GpgEngine::new(test_policy(Some(home.path().to_path_buf())));
        let encrypted = engine.encrypt_file(&plain).unwrap();

        // Exactly one file remains, and it is ciphertext
        assert!(!plain.exists());
        assert!(encrypted.exists());
        assert!(looks_encrypted(&encrypted));

        let prompt = ScriptedPrompt {
            confirm_answer: false,
            selection: None,
        };
        let decrypted = engine.decrypt_file(&encrypted, None, &prompt).unwrap();
        assert_eq!(decrypted, plain);
        assert_eq!(std::fs::read(&decrypted).unwrap(), original);
    }

    #[test]
    fn test_encrypt_without_recipients_fails() {
        let mut policy = test_policy(None);
        policy.recipients.clear();
        let engine = GpgEngine::new(policy);

        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("file");
        std::fs::write(&input, b"data").unwrap();

        assert!(engine.encrypt_file(&input).is_err());
        // Plaintext untouched on failure
        assert!(input.exists());
    }
}
