/// Interactive menu mode
///
/// Entered when the CLI is invoked without a subcommand. Every action
/// delegates to the same orchestrators the subcommands use; the menu
/// itself holds no business logic.

use anyhow::Result;
use std::io::{self, Write};
use std::str::FromStr;

use crate::core::artifact::{self, Category};
use crate::core::backup::BackupManager;
use crate::core::config::Settings;
use crate::core::docker::DockerManager;
use crate::core::restore::RestoreManager;
use crate::core::secrets::SecretsStore;
use crate::core::update::UpdateManager;
use crate::utils::constants::SERVICES;
use crate::utils::helpers::format_bytes;
use crate::utils::prompt::StdinPrompt;
use crate::utils::status;

pub async fn run(env_file: &str) -> Result<()> {
    let root = crate::utils::app_config::find_deployment_dir()?;
    let env_path = {
        let p = std::path::Path::new(env_file);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };
    let settings = Settings::load(&env_path)?.resolved_against(&root);
    let docker = DockerManager::new(root, &settings.compose_project)?;

    if !docker.check_docker().await? {
        status::warn("Docker daemon is not responding; most actions will fail");
    }

    println!("ncops - Nextcloud stack operations");
    println!("Deployment: {} (project {})", settings.hostname, settings.compose_project);

    loop {
        println!();
        println!("  1) Stack status");
        println!("  2) Full backup");
        println!("  3) Backup one category");
        println!("  4) List backups");
        println!("  5) Restore");
        println!("  6) Update all services");
        println!("  7) Clean up old backups");
        println!("  8) Secrets overview");
        println!("  q) Quit");
        print!("> ");
        io::stdout().flush()?;

        let mut choice = String::new();
        if io::stdin().read_line(&mut choice)? == 0 {
            // EOF
            return Ok(());
        }

        let result = match choice.trim() {
            "1" => show_status(&settings, &docker).await,
            "2" => BackupManager::new(&settings, &docker).backup_full().await,
            "3" => backup_category(&settings, &docker).await,
            "4" => list_backups(&settings),
            "5" => restore(&settings, &docker).await,
            "6" => {
                UpdateManager::new(&settings, &docker, &StdinPrompt)
                    .update_all(false)
                    .await
                    .map_err(Into::into)
            }
            "7" => BackupManager::new(&settings, &docker).cleanup(),
            "8" => show_secrets(&settings),
            "q" | "Q" => return Ok(()),
            "" => continue,
            other => {
                status::warn(&format!("Unknown option '{}'", other));
                continue;
            }
        };

        if let Err(e) = result {
            status::error(&format!("{e:#}"));
        }
    }
}

async fn show_status(settings: &Settings, docker: &DockerManager) -> Result<()> {
    println!("\n{:<15} {:<12} {:<10}", "Service", "State", "Health");
    println!("{}", "-".repeat(40));
    for service in SERVICES {
        let container = settings.container_name(service.name);
        let (state, health) = match docker.inspect(&container).await? {
            Some(info) => (info.state.as_str(), format!("{:?}", info.health)),
            None => ("Missing", "-".to_string()),
        };
        println!("{:<15} {:<12} {:<10}", service.name, state, health);
    }
    Ok(())
}

async fn backup_category(settings: &Settings, docker: &DockerManager) -> Result<()> {
    let prompt = StdinPrompt;
    let labels: Vec<String> = Category::ALL.iter().map(|c| c.to_string()).collect();
    let Some(index) = crate::utils::prompt::Prompt::select(&prompt, "Category:", &labels) else {
        return Ok(());
    };

    let manager = BackupManager::new(settings, docker);
    match Category::from_str(&labels[index])? {
        Category::Database => manager.backup_database().await.map(|_| ()),
        Category::Data => manager.backup_data().await.map(|_| ()),
        Category::Config => manager.backup_config().await.map(|_| ()),
        Category::Volumes => manager.backup_volumes().await.map(|_| ()),
        Category::Logs => manager.backup_logs().await.map(|_| ()),
    }
}

fn list_backups(settings: &Settings) -> Result<()> {
    let artifacts = artifact::list(&settings.backup_dir)?;
    if artifacts.is_empty() {
        println!("No backups in {}", settings.backup_dir.display());
        return Ok(());
    }
    for a in artifacts {
        println!(
            "{:<10} {:<17} {:>10}  {}",
            a.category.to_string(),
            a.timestamp.format(artifact::TIMESTAMP_FORMAT),
            format_bytes(a.size),
            if a.encrypted { "encrypted" } else { "" }
        );
    }
    Ok(())
}

async fn restore(settings: &Settings, docker: &DockerManager) -> Result<()> {
    let prompt = StdinPrompt;
    let options = vec![
        "database".to_string(),
        "data".to_string(),
        "config".to_string(),
        "volumes".to_string(),
        "full".to_string(),
    ];
    let Some(index) = crate::utils::prompt::Prompt::select(&prompt, "Restore what:", &options)
    else {
        return Ok(());
    };

    let manager = RestoreManager::new(settings, docker, &prompt);
    match options[index].as_str() {
        "database" => manager.restore_database(None).await,
        "data" => manager.restore_data(None).await,
        "config" => manager.restore_config(None).await,
        "volumes" => manager.restore_volume(None).await,
        "full" => manager.restore_full().await,
        _ => unreachable!(),
    }
}

fn show_secrets(settings: &Settings) -> Result<()> {
    let store = SecretsStore::new(&settings.secrets_dir);
    println!("\nSecrets in {}", store.dir().display());
    for (name, preview) in store.list()? {
        println!("  {:<28} {}", name, preview);
    }
    Ok(())
}
