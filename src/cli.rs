/// CLI argument parsing and command definitions

use clap::{Parser, Subcommand};

// Build timestamp injected at compile time
pub const BUILD_TIMESTAMP: &str = env!("BUILD_TIMESTAMP");
pub const VERSION_WITH_BUILD: &str =
    concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "ncops-cli")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Path to the deployment .env file
    #[arg(long, default_value = ".env", global = true)]
    pub env_file: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show service status and health
    Status,

    /// Start services
    Start {
        /// Specific service to start (all services when omitted)
        service: Option<String>,
    },

    /// Stop services
    Stop {
        /// Specific service to stop (all services when omitted)
        service: Option<String>,
    },

    /// Restart a service
    Restart {
        /// Service to restart
        service: String,
    },

    /// View logs
    Logs {
        /// Service name
        service: String,

        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "100")]
        tail: usize,
    },

    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Restore from a backup
    Restore {
        /// Category: database, data, config, volumes or full
        category: String,

        /// Backup timestamp (YYYYMMDD_HHMMSS); interactive selection when
        /// omitted
        timestamp: Option<String>,
    },

    /// Pull new images and replace services, with automatic rollback
    Update {
        /// Service to update
        service: Option<String>,

        /// Update every service in dependency order
        #[arg(short, long)]
        all: bool,

        /// Replace the container even when the image is unchanged
        #[arg(short, long)]
        force: bool,

        /// Do not roll back on a failed health check
        #[arg(long)]
        no_rollback: bool,
    },

    /// Secrets management
    Secrets {
        #[command(subcommand)]
        command: SecretsCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a backup
    Create {
        /// Category: database, data, config, volumes, logs or full
        #[arg(default_value = "full")]
        category: String,
    },

    /// List backup artifacts
    List {
        /// Emit the list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarize artifacts per category
    Status,

    /// Decrypt a backup artifact
    Decrypt {
        /// Path to the encrypted artifact
        file: String,

        /// Output path (derived from the input when omitted)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Delete artifacts past their retention window
    Cleanup,
}

#[derive(Subcommand)]
pub enum SecretsCommands {
    /// Create the secrets directory and any missing secrets
    Init,

    /// List secret names with masked previews
    List,

    /// Regenerate one secret
    Rotate {
        /// Secret name
        name: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the configuration (sensitive values masked)
    Show,

    /// Validate the configuration
    Validate,
}
