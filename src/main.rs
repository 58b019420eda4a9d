use anyhow::{anyhow, Result};
use clap::Parser;

use ncops_cli::cli::{BackupCommands, Cli, Commands, ConfigCommands, SecretsCommands};
use ncops_cli::core::artifact::{self, Category};
use ncops_cli::core::backup::BackupManager;
use ncops_cli::core::config::{ConfigManager, Settings};
use ncops_cli::core::crypto::GpgEngine;
use ncops_cli::core::docker::DockerManager;
use ncops_cli::core::restore::RestoreManager;
use ncops_cli::core::secrets::SecretsStore;
use ncops_cli::core::update::UpdateManager;
use ncops_cli::menu;
use ncops_cli::utils::constants::SERVICES;
use ncops_cli::utils::helpers::{format_bytes, format_duration, mask_sensitive};
use ncops_cli::utils::prompt::{AssumeNo, Prompt, StdinPrompt};
use ncops_cli::utils::status;

use std::str::FromStr;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => {
            // No command: run the interactive menu
            menu::run(&cli.env_file).await?;
        }
        Some(Commands::Status) => {
            handle_status(&cli.env_file).await?;
        }
        Some(Commands::Start { service }) => {
            handle_start(&cli.env_file, service).await?;
        }
        Some(Commands::Stop { service }) => {
            handle_stop(&cli.env_file, service).await?;
        }
        Some(Commands::Restart { service }) => {
            handle_restart(&cli.env_file, service).await?;
        }
        Some(Commands::Logs { service, tail }) => {
            handle_logs(&cli.env_file, service, tail).await?;
        }
        Some(Commands::Backup { command }) => {
            handle_backup(&cli.env_file, command).await?;
        }
        Some(Commands::Restore {
            category,
            timestamp,
        }) => {
            handle_restore(&cli.env_file, category, timestamp).await?;
        }
        Some(Commands::Update {
            service,
            all,
            force,
            no_rollback,
        }) => {
            handle_update(&cli.env_file, service, all, force, no_rollback).await?;
        }
        Some(Commands::Secrets { command }) => {
            handle_secrets(&cli.env_file, command)?;
        }
        Some(Commands::Config { command }) => {
            handle_config(&cli.env_file, command)?;
        }
    }

    Ok(())
}

/// Interactive prompt on a terminal, fail-closed otherwise.
fn make_prompt() -> Box<dyn Prompt> {
    use std::io::IsTerminal;
    if std::io::stdin().is_terminal() {
        Box::new(StdinPrompt)
    } else {
        Box::new(AssumeNo)
    }
}

/// Load settings from the deployment's .env, with relative paths resolved
/// against the deployment directory.
fn load_settings(env_file: &str) -> Result<Settings> {
    let root = ncops_cli::utils::app_config::find_deployment_dir()?;
    let env_path = {
        let p = std::path::Path::new(env_file);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            root.join(p)
        }
    };

    // Export the deployment variables so compose subprocesses see them too
    dotenv::from_path(&env_path).ok();

    Ok(Settings::load(&env_path)?.resolved_against(&root))
}

fn connect(settings: &Settings) -> Result<DockerManager> {
    let root = ncops_cli::utils::app_config::find_deployment_dir()?;
    DockerManager::new(root, &settings.compose_project)
}

async fn handle_status(env_file: &str) -> Result<()> {
    let settings = load_settings(env_file)?;
    let docker = connect(&settings)?;

    println!("Nextcloud Stack Status\n");
    println!("{:<15} {:<25} {:<12} {:<10}", "Service", "Container", "State", "Health");
    println!("{}", "-".repeat(65));

    // Inspect in parallel; one slow container should not serialize the table
    let lookups = SERVICES.iter().map(|service| {
        let container = settings.container_name(service.name);
        let docker = &docker;
        async move { (service.name, container.clone(), docker.inspect(&container).await) }
    });

    for (name, container, info) in futures::future::join_all(lookups).await {
        let (state, health) = match info? {
            Some(info) => (info.state.as_str(), format!("{:?}", info.health)),
            None => ("Missing", "-".to_string()),
        };
        println!("{:<15} {:<25} {:<12} {:<10}", name, container, state, health);
    }

    Ok(())
}

async fn handle_start(env_file: &str, service: Option<String>) -> Result<()> {
    use ncops_cli::core::docker::ContainerRuntime;

    let settings = load_settings(env_file)?;
    let docker = connect(&settings)?;

    if let Some(service) = service {
        status::info(&format!("Starting {}", service));
        docker.up_service(&service).await?;
        status::success(&format!("{} started", service));
    } else {
        status::info("Starting all services");
        docker.start_all()?;
        status::success("All services started");
    }

    Ok(())
}

async fn handle_stop(env_file: &str, service: Option<String>) -> Result<()> {
    use ncops_cli::core::docker::ContainerRuntime;

    let settings = load_settings(env_file)?;
    let docker = connect(&settings)?;

    if let Some(service) = service {
        status::info(&format!("Stopping {}", service));
        docker.stop_service(&service).await?;
        status::success(&format!("{} stopped", service));
    } else {
        status::info("Stopping all services");
        docker.stop_all()?;
        status::success("All services stopped");
    }

    Ok(())
}

async fn handle_restart(env_file: &str, service: String) -> Result<()> {
    let settings = load_settings(env_file)?;
    let docker = connect(&settings)?;

    status::info(&format!("Restarting {}", service));
    docker.restart_service(&service)?;
    status::success(&format!("{} restarted", service));

    Ok(())
}

async fn handle_logs(env_file: &str, service: String, tail: usize) -> Result<()> {
    let settings = load_settings(env_file)?;
    let docker = connect(&settings)?;

    let logs = docker.logs(&service, tail)?;
    print!("{}", logs);

    Ok(())
}

async fn handle_backup(env_file: &str, command: BackupCommands) -> Result<()> {
    let settings = load_settings(env_file)?;

    match command {
        BackupCommands::Create { category } => {
            let docker = connect(&settings)?;
            let manager = BackupManager::new(&settings, &docker);

            // Verify recipients up front so a policy misconfiguration
            // fails before any dump runs
            if settings.gpg.enabled {
                GpgEngine::new(settings.gpg.clone()).verify_recipients()?;
            }

            if category.eq_ignore_ascii_case("full") {
                manager.backup_full().await?;
            } else {
                match Category::from_str(&category)? {
                    Category::Database => {
                        manager.backup_database().await?;
                    }
                    Category::Data => {
                        manager.backup_data().await?;
                    }
                    Category::Config => {
                        manager.backup_config().await?;
                    }
                    Category::Volumes => {
                        manager.backup_volumes().await?;
                    }
                    Category::Logs => {
                        manager.backup_logs().await?;
                    }
                }
                status::success(&format!("{} backup complete", category));
            }
        }
        BackupCommands::List { json } => {
            let artifacts = artifact::list(&settings.backup_dir)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&artifacts)?);
                return Ok(());
            }

            if artifacts.is_empty() {
                println!("No backups in {}", settings.backup_dir.display());
                return Ok(());
            }

            println!("{:<10} {:<18} {:<17} {:<10} {}", "Category", "Name", "Timestamp", "Size", "Encrypted");
            println!("{}", "-".repeat(70));
            for a in artifacts {
                println!(
                    "{:<10} {:<18} {:<17} {:<10} {}",
                    a.category.to_string(),
                    a.name,
                    a.timestamp.format(artifact::TIMESTAMP_FORMAT),
                    format_bytes(a.size),
                    if a.encrypted { "yes" } else { "no" }
                );
            }
        }
        BackupCommands::Status => {
            let artifacts = artifact::list(&settings.backup_dir)?;
            let now = artifact::now_stamp();

            println!("Backup status for {}\n", settings.backup_dir.display());
            for &category in Category::ALL {
                let of_category: Vec<_> =
                    artifacts.iter().filter(|a| a.category == category).collect();
                let total: u64 = of_category.iter().map(|a| a.size).sum();
                let newest = of_category
                    .first()
                    .map(|a| {
                        let age = a.age(now).num_seconds().max(0) as u64;
                        format!("{} ago", format_duration(age))
                    })
                    .unwrap_or_else(|| "never".to_string());

                println!(
                    "{:<10} {:>3} artifact(s), {:>10}, newest {}",
                    category.to_string(),
                    of_category.len(),
                    format_bytes(total),
                    newest
                );
            }
        }
        BackupCommands::Decrypt { file, output } => {
            let prompt = make_prompt();
            let engine = GpgEngine::new(settings.gpg.clone());
            let out = engine
                .decrypt_file(
                    std::path::Path::new(&file),
                    output.as_deref().map(std::path::Path::new),
                    prompt.as_ref(),
                )
                .map_err(|e| anyhow!("{e}"))?;
            status::success(&format!("Decrypted to {}", out.display()));
        }
        BackupCommands::Cleanup => {
            let docker = connect(&settings)?;
            let manager = BackupManager::new(&settings, &docker);
            manager.cleanup()?;
        }
    }

    Ok(())
}

async fn handle_restore(env_file: &str, category: String, timestamp: Option<String>) -> Result<()> {
    let settings = load_settings(env_file)?;
    let docker = connect(&settings)?;
    let prompt = make_prompt();
    let manager = RestoreManager::new(&settings, &docker, prompt.as_ref());
    let timestamp = timestamp.as_deref();

    if category.eq_ignore_ascii_case("full") {
        manager.restore_full().await?;
        return Ok(());
    }

    match Category::from_str(&category)? {
        Category::Database => manager.restore_database(timestamp).await?,
        Category::Data => manager.restore_data(timestamp).await?,
        Category::Config => manager.restore_config(timestamp).await?,
        Category::Volumes => manager.restore_volume(timestamp).await?,
        Category::Logs => {
            return Err(anyhow!("log bundles are informational; extract them manually"))
        }
    }

    Ok(())
}

async fn handle_update(
    env_file: &str,
    service: Option<String>,
    all: bool,
    force: bool,
    no_rollback: bool,
) -> Result<()> {
    let settings = load_settings(env_file)?;
    let docker = connect(&settings)?;
    let prompt = make_prompt();

    let mut manager = UpdateManager::new(&settings, &docker, prompt.as_ref());
    manager.rollback_enabled = !no_rollback;

    if all {
        manager.update_all(force).await?;
    } else if let Some(service) = service {
        match manager.update_service(&service, force).await? {
            ncops_cli::core::update::UpdateOutcome::UpToDate => {
                status::info(&format!("{} is already up to date", service))
            }
            ncops_cli::core::update::UpdateOutcome::Updated => {
                status::success(&format!("{} updated", service))
            }
        }
    } else {
        return Err(anyhow!("specify a service or --all"));
    }

    Ok(())
}

fn handle_secrets(env_file: &str, command: SecretsCommands) -> Result<()> {
    let settings = load_settings(env_file)?;
    let store = SecretsStore::new(&settings.secrets_dir);

    match command {
        SecretsCommands::Init => {
            let created = store.init()?;
            if created.is_empty() {
                status::info("All secrets already exist");
            } else {
                for name in created {
                    status::success(&format!("Generated {}", name));
                }
            }
        }
        SecretsCommands::List => {
            println!("Secrets in {}\n", store.dir().display());
            for (name, preview) in store.list()? {
                println!("{:<28} {}", name, preview);
            }
        }
        SecretsCommands::Rotate { name } => {
            let prompt = make_prompt();
            if store.rotate(&name, prompt.as_ref())? {
                status::success(&format!("Rotated {}", name));
            } else {
                status::info("Rotation cancelled");
            }
        }
    }

    Ok(())
}

fn handle_config(env_file: &str, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = ConfigManager::load(env_file)?;
            println!("Configuration ({})\n", env_file);
            for key in config.keys() {
                if let Some(value) = config.get(&key) {
                    // Mask sensitive values
                    let display = if key.contains("PASSWORD")
                        || key.contains("SECRET")
                        || key.contains("KEY")
                    {
                        mask_sensitive(value, 2)
                    } else {
                        value.to_string()
                    };
                    println!("{}: {}", key, display);
                }
            }
        }
        ConfigCommands::Validate => {
            let settings = load_settings(env_file)?;
            let errors = settings.validate();
            if errors.is_empty() {
                status::success("Configuration is valid");
            } else {
                for error in &errors {
                    status::error(error);
                }
                return Err(anyhow!("{} configuration error(s)", errors.len()));
            }
        }
    }

    Ok(())
}
