/// Rolling update orchestrator
///
/// Each service walks an explicit state machine:
///
/// ```text
/// Pending -> ImagePulled -> Snapshotted -> Replaced -> HealthChecking
///                                                       |        |
///                                                    Healthy   Failed -> RollingBack -> RolledBack
///                                                                                    -> RollbackFailed
/// ```
///
/// The snapshot (committed image + renamed container) is the rollback
/// point. A full-stack update walks the fixed dependency order and stops
/// at the first failed service; partial success is not acceptable because
/// later services may rely on earlier ones carrying the new version.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::core::artifact::TIMESTAMP_FORMAT;
use crate::core::config::Settings;
use crate::core::docker::{ContainerRuntime, HealthStatus};
use crate::core::occ::Occ;
use crate::utils::constants::{
    HEALTH_POLL_INTERVAL_SECS, HEALTH_TIMEOUT_SECS, ROLLBACK_HEALTH_TIMEOUT_SECS, UPDATE_ORDER,
};
use crate::utils::prompt::Prompt;
use crate::utils::status;
use crate::utils::ContainerState;

/// Update progress of a single service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    Pending,
    ImagePulled,
    UpToDate,
    Snapshotted,
    Replaced,
    HealthChecking,
    Healthy,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

/// Terminal result of a successful walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Pulled image matches the running container; nothing replaced.
    UpToDate,
    /// Service replaced and healthy.
    Updated,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("image pull for {service} failed: {reason}")]
    Pull { service: String, reason: String },
    #[error("snapshot of {service} failed ({reason}); live container left as is")]
    Snapshot { service: String, reason: String },
    #[error("update of {service} failed ({reason}); rolled back to the previous version")]
    RolledBack { service: String, reason: String },
    #[error(
        "update of {service} failed ({reason}) and rollback is disabled; \
         the stack may be running a mix of old and new containers"
    )]
    FailedNoRollback { service: String, reason: String },
    #[error(
        "update of {service} failed ({reason}) and ROLLBACK FAILED ({rollback_reason}); \
         both old and new containers may be unavailable, manual intervention required"
    )]
    RollbackFailed {
        service: String,
        reason: String,
        rollback_reason: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pre-update state captured as rollback point.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub service: String,
    /// Name of the renamed pre-update container and the committed image.
    pub key: String,
}

pub struct UpdateManager<'a, R: ContainerRuntime> {
    settings: &'a Settings,
    runtime: &'a R,
    prompt: &'a dyn Prompt,
    pub rollback_enabled: bool,
    pub poll_interval: Duration,
    pub health_timeout: Duration,
    pub rollback_health_timeout: Duration,
}

impl<'a, R: ContainerRuntime> UpdateManager<'a, R> {
    pub fn new(settings: &'a Settings, runtime: &'a R, prompt: &'a dyn Prompt) -> Self {
        Self {
            settings,
            runtime,
            prompt,
            rollback_enabled: true,
            poll_interval: Duration::from_secs(HEALTH_POLL_INTERVAL_SECS),
            health_timeout: Duration::from_secs(HEALTH_TIMEOUT_SECS),
            rollback_health_timeout: Duration::from_secs(ROLLBACK_HEALTH_TIMEOUT_SECS),
        }
    }

    /// Update every service in the fixed dependency order, aborting the
    /// run on the first failure. On success, run the in-container upgrade
    /// and repair commands inside a maintenance window.
    pub async fn update_all(&self, force: bool) -> Result<(), UpdateError> {
        for service in UPDATE_ORDER {
            status::info(&format!("Updating {}", service));
            match self.update_service(service, force).await? {
                UpdateOutcome::UpToDate => {
                    status::info(&format!("{} is already up to date", service))
                }
                UpdateOutcome::Updated => status::success(&format!("{} updated", service)),
            }
        }

        self.post_update().await.map_err(UpdateError::Other)
    }

    async fn post_update(&self) -> anyhow::Result<()> {
        status::info("Running in-container upgrade and repair");
        let occ = Occ::new(self.runtime);

        occ.set_maintenance(true).await?;
        let result = async {
            occ.upgrade().await?;
            occ.add_missing_indices().await?;
            occ.maintenance_repair().await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = occ.set_maintenance(false).await {
            status::warn(&format!("could not disable maintenance mode: {e:#}"));
        }
        result?;
        status::success("Stack update complete");
        Ok(())
    }

    /// Walk one service through the update state machine.
    pub async fn update_service(
        &self,
        service: &str,
        force: bool,
    ) -> Result<UpdateOutcome, UpdateError> {
        let container = self.settings.container_name(service);
        let mut snapshot: Option<Snapshot> = None;
        // Reason carried from the failure into the rollback arms
        let mut failure_reason = String::new();
        let mut state = UpdateState::Pending;

        loop {
            state = match state {
                UpdateState::Pending => {
                    // No side effects yet; a failed pull leaves everything
                    // untouched.
                    match self.runtime.pull(service).await {
                        Ok(()) => UpdateState::ImagePulled,
                        Err(e) => {
                            return Err(UpdateError::Pull {
                                service: service.to_string(),
                                reason: format!("{e:#}"),
                            })
                        }
                    }
                }

                UpdateState::ImagePulled => {
                    if !force && self.already_up_to_date(service, &container).await? {
                        UpdateState::UpToDate
                    } else {
                        match self.take_snapshot(service, &container).await {
                            Ok(s) => {
                                snapshot = Some(s);
                                UpdateState::Snapshotted
                            }
                            Err(e) => {
                                return Err(UpdateError::Snapshot {
                                    service: service.to_string(),
                                    reason: format!("{e:#}"),
                                })
                            }
                        }
                    }
                }

                UpdateState::UpToDate => return Ok(UpdateOutcome::UpToDate),

                UpdateState::Snapshotted => match self.runtime.up_service(service).await {
                    Ok(()) => UpdateState::Replaced,
                    Err(e) => {
                        failure_reason = format!("start of new container failed: {e:#}");
                        UpdateState::Failed
                    }
                },

                UpdateState::Replaced => UpdateState::HealthChecking,

                UpdateState::HealthChecking => {
                    match self
                        .wait_healthy(&container, self.health_timeout, "health check")
                        .await
                    {
                        Ok(()) => UpdateState::Healthy,
                        Err(reason) => {
                            failure_reason = reason;
                            UpdateState::Failed
                        }
                    }
                }

                UpdateState::Healthy => {
                    let snapshot = snapshot.expect("healthy implies snapshotted");
                    self.offer_snapshot_cleanup(&snapshot).await;
                    return Ok(UpdateOutcome::Updated);
                }

                // The only place rollback can start from.
                UpdateState::Failed => {
                    if self.rollback_enabled {
                        UpdateState::RollingBack
                    } else {
                        return Err(UpdateError::FailedNoRollback {
                            service: service.to_string(),
                            reason: failure_reason,
                        });
                    }
                }

                UpdateState::RollingBack => {
                    let snap = snapshot.as_ref().expect("rollback requires a snapshot");
                    status::warn(&format!(
                        "Rolling back {} ({})",
                        service, failure_reason
                    ));
                    match self.roll_back(&container, snap).await {
                        Ok(()) => UpdateState::RolledBack,
                        Err(e) => {
                            return Err(UpdateError::RollbackFailed {
                                service: service.to_string(),
                                reason: failure_reason,
                                rollback_reason: format!("{e:#}"),
                            })
                        }
                    }
                }

                UpdateState::RolledBack => {
                    return Err(UpdateError::RolledBack {
                        service: service.to_string(),
                        reason: failure_reason,
                    })
                }

                UpdateState::RollbackFailed => unreachable!("returned from RollingBack"),
            };
        }
    }

    /// Pulled image identity equals the running container's image.
    async fn already_up_to_date(&self, service: &str, container: &str) -> Result<bool, UpdateError> {
        let image_ref = self.runtime.configured_image(service).await?;
        let pulled = self.runtime.image_id(&image_ref).await?;
        let running = self.runtime.container_image_id(container).await?;

        Ok(match (pulled, running) {
            (Some(pulled), Some(running)) => pulled == running,
            _ => false,
        })
    }

    /// Stop the running container, commit it, and rename it out of the
    /// way under the snapshot key.
    async fn take_snapshot(&self, service: &str, container: &str) -> anyhow::Result<Snapshot> {
        let key = format!(
            "{}_{}_backup_{}",
            self.settings.compose_project,
            service,
            chrono::Local::now().format(TIMESTAMP_FORMAT)
        );

        self.runtime.stop_container(container).await?;

        let result = async {
            self.runtime.commit(container, &key).await?;
            self.runtime.rename(container, &key).await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = result {
            // Bring the stopped container back up; the update is off.
            if let Err(restart) = self.runtime.start_container(container).await {
                status::warn(&format!(
                    "could not restart {} after failed snapshot: {restart:#}",
                    container
                ));
            }
            return Err(e);
        }

        status::info(&format!("Snapshot {} created", key));
        Ok(Snapshot {
            service: service.to_string(),
            key,
        })
    }

    /// Poll until the container is running and (if it declares one) its
    /// health check passes. Timeout and terminal states are failures.
    async fn wait_healthy(
        &self,
        container: &str,
        timeout: Duration,
        label: &str,
    ) -> Result<(), String> {
        let spinner = indicatif::ProgressBar::new_spinner();
        spinner.set_message(format!("{} for {}", label, container));

        let started = tokio::time::Instant::now();
        let result = loop {
            spinner.tick();

            let state = match self.runtime.status(container).await {
                Ok(state) => state,
                Err(e) => break Err(format!("status query failed: {e:#}")),
            };

            match state {
                ContainerState::Running => {
                    match self.runtime.health(container).await {
                        Ok(HealthStatus::Healthy) | Ok(HealthStatus::None) => break Ok(()),
                        Ok(HealthStatus::Unhealthy) | Ok(HealthStatus::Starting) => {}
                        Err(e) => break Err(format!("health query failed: {e:#}")),
                    }
                }
                ContainerState::Restarting => {}
                // Terminal: the container is not coming back on its own
                ContainerState::Stopped | ContainerState::Dead | ContainerState::Missing => {
                    break Err(format!("container is {}", state.as_str().to_lowercase()));
                }
                ContainerState::Paused | ContainerState::Unknown => {}
            }

            if started.elapsed() >= timeout {
                break Err(format!(
                    "{} timed out after {}",
                    label,
                    humantime::format_duration(timeout)
                ));
            }
            sleep(self.poll_interval).await;
        };

        spinner.finish_and_clear();
        result
    }

    /// Remove the failed container, move the snapshot back under the live
    /// name and start it.
    async fn roll_back(&self, container: &str, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.runtime.remove_container(container).await?;
        self.runtime.rename(&snapshot.key, container).await?;
        self.runtime.start_container(container).await?;

        self.wait_healthy(container, self.rollback_health_timeout, "rollback health check")
            .await
            .map_err(|reason| anyhow::anyhow!("{}", reason))?;

        status::success(&format!("{} rolled back to its pre-update state", snapshot.service));
        Ok(())
    }

    /// Keep the snapshot unless the operator explicitly lets it go.
    async fn offer_snapshot_cleanup(&self, snapshot: &Snapshot) {
        if self.prompt.confirm(
            &format!("Delete rollback snapshot {} (image and container)", snapshot.key),
            false,
        ) {
            if let Err(e) = self.runtime.remove_container(&snapshot.key).await {
                status::warn(&format!("could not remove snapshot container: {e:#}"));
            }
            if let Err(e) = self.runtime.remove_image(&snapshot.key).await {
                status::warn(&format!("could not remove snapshot image: {e:#}"));
            }
        } else {
            status::info(&format!("Snapshot {} kept", snapshot.key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{
        DatabaseLocation, EncryptSet, GpgPolicy, RetentionWindows, Settings,
    };
    use anyhow::{anyhow, Result};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn test_settings() -> Settings {
        Settings {
            hostname: "cloud.example.com".to_string(),
            compose_project: "nextcloud".to_string(),
            database: DatabaseLocation::Managed,
            db_name: "nextcloud".to_string(),
            db_user: "nextcloud".to_string(),
            data_dir: PathBuf::from("/tmp/data"),
            secrets_dir: PathBuf::from("/tmp/secrets"),
            backup_dir: PathBuf::from("/tmp/backups"),
            gpg: GpgPolicy {
                enabled: false,
                recipients: vec![],
                include: EncryptSet::None,
                cipher: "AES256".to_string(),
                compress_level: 6,
                home_dir: None,
            },
            retention: RetentionWindows {
                data_days: 14,
                config_days: 30,
            },
        }
    }

    /// Scripted runtime double recording every call.
    struct FakeRuntime {
        calls: RefCell<Vec<String>>,
        containers: RefCell<HashMap<String, ContainerState>>,
        /// Image id the configured reference resolves to after pull
        pulled_id: String,
        /// Image id of the running container
        running_id: String,
        /// Health reported while the replacement container is active
        replacement_health: HealthStatus,
        /// Flipped by up_service / rename-back
        replacement_active: RefCell<bool>,
        fail_pull: bool,
        fail_rollback_start: bool,
    }

    impl FakeRuntime {
        fn new(pulled_id: &str, running_id: &str) -> Self {
            let mut containers = HashMap::new();
            containers.insert("nextcloud-app".to_string(), ContainerState::Running);
            Self {
                calls: RefCell::new(Vec::new()),
                containers: RefCell::new(containers),
                pulled_id: pulled_id.to_string(),
                running_id: running_id.to_string(),
                replacement_health: HealthStatus::None,
                replacement_active: RefCell::new(false),
                fail_pull: false,
                fail_rollback_start: false,
            }
        }

        fn record(&self, call: &str) {
            self.calls.borrow_mut().push(call.to_string());
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        async fn pull(&self, service: &str) -> Result<()> {
            self.record(&format!("pull {service}"));
            if self.fail_pull {
                return Err(anyhow!("registry unreachable"));
            }
            Ok(())
        }

        async fn configured_image(&self, _service: &str) -> Result<String> {
            Ok("nextcloud:29-apache".to_string())
        }

        async fn image_id(&self, _image_ref: &str) -> Result<Option<String>> {
            Ok(Some(self.pulled_id.clone()))
        }

        async fn container_image_id(&self, _container: &str) -> Result<Option<String>> {
            Ok(Some(self.running_id.clone()))
        }

        async fn status(&self, container: &str) -> Result<ContainerState> {
            Ok(self
                .containers
                .borrow()
                .get(container)
                .copied()
                .unwrap_or(ContainerState::Missing))
        }

        async fn health(&self, _container: &str) -> Result<HealthStatus> {
            if *self.replacement_active.borrow() {
                Ok(self.replacement_health)
            } else {
                Ok(HealthStatus::None)
            }
        }

        async fn stop_service(&self, service: &str) -> Result<()> {
            self.record(&format!("stop_service {service}"));
            Ok(())
        }

        async fn up_service(&self, service: &str) -> Result<()> {
            self.record(&format!("up_service {service}"));
            self.containers.borrow_mut().insert(
                format!("nextcloud-{service}"),
                ContainerState::Running,
            );
            *self.replacement_active.borrow_mut() = true;
            Ok(())
        }

        async fn start_container(&self, container: &str) -> Result<()> {
            self.record(&format!("start_container {container}"));
            if self.fail_rollback_start {
                return Err(anyhow!("no such container"));
            }
            self.containers
                .borrow_mut()
                .insert(container.to_string(), ContainerState::Running);
            Ok(())
        }

        async fn stop_container(&self, container: &str) -> Result<()> {
            self.record(&format!("stop_container {container}"));
            self.containers
                .borrow_mut()
                .insert(container.to_string(), ContainerState::Stopped);
            Ok(())
        }

        async fn remove_container(&self, container: &str) -> Result<()> {
            self.record(&format!("remove_container {container}"));
            self.containers.borrow_mut().remove(container);
            Ok(())
        }

        async fn remove_image(&self, image: &str) -> Result<()> {
            self.record(&format!("remove_image {image}"));
            Ok(())
        }

        async fn commit(&self, container: &str, image_tag: &str) -> Result<()> {
            self.record(&format!("commit {container} {image_tag}"));
            Ok(())
        }

        async fn rename(&self, container: &str, new_name: &str) -> Result<()> {
            self.record(&format!("rename {container} {new_name}"));
            let state = self
                .containers
                .borrow_mut()
                .remove(container)
                .unwrap_or(ContainerState::Stopped);
            self.containers
                .borrow_mut()
                .insert(new_name.to_string(), state);
            // Renaming the snapshot back means the old version is active
            if new_name == "nextcloud-app" {
                *self.replacement_active.borrow_mut() = false;
            }
            Ok(())
        }

        async fn exec(&self, service: &str, _user: Option<&str>, cmd: &[&str]) -> Result<String> {
            self.record(&format!("exec {service} {}", cmd.join(" ")));
            // Answer occ maintenance:mode state queries
            if cmd.contains(&"maintenance:mode") && !cmd.contains(&"--on") && !cmd.contains(&"--off")
            {
                return Ok("Maintenance mode is currently disabled".to_string());
            }
            Ok(String::new())
        }
    }

    fn manager<'a>(
        settings: &'a Settings,
        runtime: &'a FakeRuntime,
        prompt: &'a crate::utils::prompt::ScriptedPrompt,
    ) -> UpdateManager<'a, FakeRuntime> {
        let mut m = UpdateManager::new(settings, runtime, prompt);
        m.poll_interval = Duration::from_millis(1);
        m.health_timeout = Duration::from_millis(20);
        m.rollback_health_timeout = Duration::from_millis(20);
        m
    }

    fn keep_snapshot() -> crate::utils::prompt::ScriptedPrompt {
        crate::utils::prompt::ScriptedPrompt {
            confirm_answer: false,
            selection: None,
        }
    }

    #[tokio::test]
    async fn test_up_to_date_skips_snapshot() {
        let settings = test_settings();
        let runtime = FakeRuntime::new("sha256:same", "sha256:same");
        let prompt = keep_snapshot();
        let manager = manager(&settings, &runtime, &prompt);

        let outcome = manager.update_service("app", false).await.unwrap();

        assert_eq!(outcome, UpdateOutcome::UpToDate);
        assert_eq!(runtime.count("commit"), 0);
        assert_eq!(runtime.count("rename"), 0);
        assert_eq!(runtime.count("up_service"), 0);
    }

    #[tokio::test]
    async fn test_force_updates_identical_image() {
        let settings = test_settings();
        let runtime = FakeRuntime::new("sha256:same", "sha256:same");
        let prompt = keep_snapshot();
        let manager = manager(&settings, &runtime, &prompt);

        let outcome = manager.update_service("app", true).await.unwrap();

        assert_eq!(outcome, UpdateOutcome::Updated);
        assert_eq!(runtime.count("commit"), 1);
    }

    #[tokio::test]
    async fn test_successful_update_keeps_snapshot_by_default() {
        let settings = test_settings();
        let runtime = FakeRuntime::new("sha256:new", "sha256:old");
        let prompt = keep_snapshot();
        let manager = manager(&settings, &runtime, &prompt);

        let outcome = manager.update_service("app", false).await.unwrap();

        assert_eq!(outcome, UpdateOutcome::Updated);
        assert_eq!(runtime.count("commit"), 1);
        // Fail-closed prompt: snapshot container and image are kept
        assert_eq!(runtime.count("remove_container"), 0);
        assert_eq!(runtime.count("remove_image"), 0);
    }

    #[tokio::test]
    async fn test_failed_health_check_rolls_back_once() {
        let settings = test_settings();
        let mut runtime = FakeRuntime::new("sha256:new", "sha256:old");
        runtime.replacement_health = HealthStatus::Unhealthy;
        let prompt = keep_snapshot();
        let manager = manager(&settings, &runtime, &prompt);

        let err = manager.update_service("app", false).await.unwrap_err();

        assert!(matches!(err, UpdateError::RolledBack { .. }));
        // Rollback ran exactly once: one removal of the failed container,
        // one rename back, one start
        assert_eq!(runtime.count("remove_container nextcloud-app"), 1);
        assert_eq!(runtime.count("start_container nextcloud-app"), 1);
        assert_eq!(runtime.count("rename"), 2);
        // Service ends in its pre-update running state
        assert_eq!(
            runtime.containers.borrow().get("nextcloud-app"),
            Some(&ContainerState::Running)
        );
        assert!(!*runtime.replacement_active.borrow());
    }

    #[tokio::test]
    async fn test_rollback_disabled_reports_inconsistent_state() {
        let settings = test_settings();
        let mut runtime = FakeRuntime::new("sha256:new", "sha256:old");
        runtime.replacement_health = HealthStatus::Unhealthy;
        let prompt = keep_snapshot();
        let mut manager = manager(&settings, &runtime, &prompt);
        manager.rollback_enabled = false;

        let err = manager.update_service("app", false).await.unwrap_err();

        assert!(matches!(err, UpdateError::FailedNoRollback { .. }));
        // No rename-back happened
        assert_eq!(runtime.count("rename"), 1);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_distinct() {
        let settings = test_settings();
        let mut runtime = FakeRuntime::new("sha256:new", "sha256:old");
        runtime.replacement_health = HealthStatus::Unhealthy;
        runtime.fail_rollback_start = true;
        let prompt = keep_snapshot();
        let manager = manager(&settings, &runtime, &prompt);

        let err = manager.update_service("app", false).await.unwrap_err();
        assert!(matches!(err, UpdateError::RollbackFailed { .. }));
    }

    #[tokio::test]
    async fn test_pull_failure_has_no_side_effects() {
        let settings = test_settings();
        let mut runtime = FakeRuntime::new("sha256:new", "sha256:old");
        runtime.fail_pull = true;
        let prompt = keep_snapshot();
        let manager = manager(&settings, &runtime, &prompt);

        let err = manager.update_service("app", false).await.unwrap_err();

        assert!(matches!(err, UpdateError::Pull { .. }));
        assert_eq!(runtime.count("stop_container"), 0);
        assert_eq!(runtime.count("commit"), 0);
    }
}
