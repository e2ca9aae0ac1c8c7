use anyhow::{Context, Result};
use std::{fs, path::Path};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tubeproxy-env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Raw values read from the env file; everything is optional so the server
/// can start with no configuration at all.
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub port: Option<u16>,
    pub host: Option<String>,
}

/// Resolved listen address after defaults are applied.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub port: u16,
    pub host: String,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            match key {
                "PORT" => {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("Parsing PORT from {}", path.display()))?;
                    cfg.port = Some(port);
                }
                "HOST" => {
                    if !value.is_empty() {
                        cfg.host = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    Ok(Some(cfg))
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    load_runtime_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

/// Reads the env file (if any) and applies defaults. A `TUBEPROXY_PORT`
/// environment variable wins over both.
pub fn load_runtime_config_from(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    let env_port = std::env::var("TUBEPROXY_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok());
    let port = env_port.or(cfg.port).unwrap_or(DEFAULT_PORT);
    let host = cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    Ok(RuntimeConfig { port, host })
}
