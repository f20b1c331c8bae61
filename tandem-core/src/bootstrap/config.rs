//! Configuration loading

use anyhow::Result;
use tracing::info;

use crate::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. `explicit_path` (command line)
/// 2. `TANDEM_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. Fall back to environment variables only
pub fn load_config(explicit_path: Option<&str>) -> Result<Config> {
    let config_path = explicit_path
        .map(ToString::to_string)
        .or_else(|| std::env::var("TANDEM_CONFIG_PATH").ok())
        .filter(|p| std::path::Path::new(p).exists())
        .or_else(|| {
            let cwd = "config.yaml";
            if std::path::Path::new(cwd).exists() {
                Some(cwd.to_string())
            } else {
                None
            }
        });

    // Logging is not initialized yet, so progress goes to stderr
    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}");
            eprintln!("Using default configuration");
            Config::default()
        })
    };

    // Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    info!(
        signaling_url = %config.signaling.url,
        room_id = %config.signaling.room_id,
        "Configuration loaded and validated"
    );

    Ok(config)
}
