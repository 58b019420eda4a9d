/// Interaction with the Nextcloud instance through the `occ` command,
/// executed inside the app container as the web server user.
///
/// The orchestrators treat occ exit codes as the only signal; stdout is
/// relayed to the console where it carries progress information.

use anyhow::{anyhow, Result};

use crate::core::docker::ContainerRuntime;
use crate::utils::status;

const APP_SERVICE: &str = "app";
const OCC_USER: &str = "www-data";

pub struct Occ<'a, R: ContainerRuntime> {
    runtime: &'a R,
}

impl<'a, R: ContainerRuntime> Occ<'a, R> {
    pub fn new(runtime: &'a R) -> Self {
        Self { runtime }
    }

    async fn run(&self, command: &str, extra: &[&str]) -> Result<String> {
        let mut cmd = vec!["php", "occ", "--no-warnings", command];
        cmd.extend_from_slice(extra);
        let stdout = self.runtime.exec(APP_SERVICE, Some(OCC_USER), &cmd).await?;
        Ok(stdout.trim_end().to_string())
    }

    pub async fn is_maintenance(&self) -> Result<bool> {
        let msg = self.run("maintenance:mode", &[]).await?;
        Ok(msg.contains("enabled"))
    }

    /// Toggle maintenance mode and verify the instance reports the new
    /// state.
    pub async fn set_maintenance(&self, on: bool) -> Result<()> {
        let flag = if on { "--on" } else { "--off" };
        self.run("maintenance:mode", &[flag]).await?;

        if self.is_maintenance().await? != on {
            return Err(anyhow!(
                "maintenance mode did not switch {}",
                if on { "on" } else { "off" }
            ));
        }
        Ok(())
    }

    pub async fn upgrade(&self) -> Result<()> {
        let log = self.run("upgrade", &[]).await?;
        for line in log.lines() {
            status::info(&format!("occ upgrade: {line}"));
        }
        Ok(())
    }

    pub async fn add_missing_indices(&self) -> Result<()> {
        self.run("db:add-missing-indices", &[]).await?;
        Ok(())
    }

    pub async fn maintenance_repair(&self) -> Result<()> {
        self.run("maintenance:repair", &[]).await?;
        Ok(())
    }

    pub async fn files_scan_all(&self) -> Result<()> {
        self.run("files:scan", &["--all"]).await?;
        Ok(())
    }
}
