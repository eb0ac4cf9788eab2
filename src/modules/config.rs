use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;

const DATA_DIR: &str = ".health_gateway";
const CONFIG_FILE: &str = "gateway_config.json";

/// Get data directory path (GATEWAY_DATA_DIR wins over the home directory)
pub fn get_data_dir() -> AppResult<PathBuf> {
    let data_dir = match std::env::var("GATEWAY_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .ok_or_else(|| AppError::Config("Failed to get user home directory".to_string()))?
            .join(DATA_DIR),
    };

    // Ensure directory exists
    if !data_dir.exists() {
        fs::create_dir_all(&data_dir)?;
    }

    Ok(data_dir)
}

/// Load application config from the data directory, then apply env overrides
pub fn load_app_config() -> AppResult<AppConfig> {
    let config_path = get_data_dir()?.join(CONFIG_FILE);
    let mut config = load_app_config_from(&config_path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Load config file; a missing file yields defaults
pub fn load_app_config_from(path: &Path) -> AppResult<AppConfig> {
    if !path.exists() {
        tracing::info!("Config file {:?} not found, using defaults", path);
        return Ok(AppConfig::new());
    }

    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| AppError::Config(format!("Failed to parse config file: {}", e)))
}

/// Save application config
pub fn save_app_config(config: &AppConfig) -> AppResult<()> {
    let config_path = get_data_dir()?.join(CONFIG_FILE);
    save_app_config_to(config, &config_path)
}

pub fn save_app_config_to(config: &AppConfig, path: &Path) -> AppResult<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn apply_env_overrides(config: &mut AppConfig) -> AppResult<()> {
    apply_overrides_from(config, |key| std::env::var(key).ok())
}

/// Apply GATEWAY_* overrides read through `lookup`
pub fn apply_overrides_from<F>(config: &mut AppConfig, lookup: F) -> AppResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let gateway = &mut config.gateway;

    // Environment first so URL overrides land on the active endpoints
    if let Some(env) = get("GATEWAY_ENVIRONMENT") {
        gateway.environment = env.parse()?;
    }
    if let Some(url) = get("GATEWAY_BASE_URL") {
        gateway.endpoints_mut().base_url = url;
    }
    if let Some(url) = get("GATEWAY_TOKEN_URL") {
        gateway.endpoints_mut().token_url = url;
    }
    if let Some(id) = get("GATEWAY_CLIENT_ID") {
        gateway.credentials.client_id = id;
    }
    if let Some(secret) = get("GATEWAY_CLIENT_SECRET") {
        gateway.credentials.client_secret = secret;
    }
    if let Some(scope) = get("GATEWAY_SCOPE") {
        gateway.credentials.scope = scope;
    }
    if let Some(flag) = get("GATEWAY_BYPASS_RATE_LIMIT") {
        gateway.rate_limit.bypass = parse_bool("GATEWAY_BYPASS_RATE_LIMIT", &flag)?;
    }
    if let Some(attempts) = get("GATEWAY_MAX_ATTEMPTS") {
        gateway.retry.max_attempts = attempts.parse().map_err(|_| {
            AppError::Config(format!("GATEWAY_MAX_ATTEMPTS is not a number: {}", attempts))
        })?;
    }
    if let Some(path) = get("GATEWAY_AUDIT_PATH") {
        gateway.audit.path = Some(PathBuf::from(path));
    }
    if let Some(port) = get("GATEWAY_PORT") {
        config.server.port = port
            .parse()
            .map_err(|_| AppError::Config(format!("GATEWAY_PORT is not a port: {}", port)))?;
    }
    if let Some(key) = get("GATEWAY_API_KEY") {
        config.server.api_key = key;
    }

    Ok(())
}

fn parse_bool(key: &str, value: &str) -> AppResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::Config(format!("{} is not a boolean: {}", key, value))),
    }
}
