pub mod app_config;
pub mod constants;
pub mod helpers;
pub mod prompt;
pub mod status;

pub use app_config::AppConfig;
pub use constants::*;
pub use helpers::*;
pub use prompt::{AssumeNo, Prompt, StdinPrompt};
