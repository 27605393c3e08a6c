//! Configuration loading

use anyhow::Result;
use std::path::Path;

use crate::Config;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "LIVEROOM_CONFIG_PATH";

/// Locate the config file to use.
///
/// Search order:
/// 1. the explicit path (from the command line)
/// 2. `LIVEROOM_CONFIG_PATH`
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (Kubernetes mount path)
#[must_use]
pub fn resolve_config_path(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(ToString::to_string)
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            std::env::var(CONFIG_PATH_ENV)
                .ok()
                .filter(|p| Path::new(p).exists())
        })
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(ToString::to_string)
        })
}

/// Load and validate configuration.
///
/// Logging is not initialized yet when this runs, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config = match resolve_config_path(explicit) {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_explicit_path_wins() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "jwt:\n  secret: explicit").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        assert_eq!(resolve_config_path(Some(&path)), Some(path.clone()));

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.jwt.secret, "explicit");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "logging:\n  format: xml\njwt:\n  secret: s").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }
}
