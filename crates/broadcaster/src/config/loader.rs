use std::path::Path;

use crate::config::schema::BroadcasterConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<BroadcasterConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<BroadcasterConfig, ConfigError> {
    let config: BroadcasterConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &BroadcasterConfig) -> Result<(), ConfigError> {
    if config.user_id.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "userId is required".to_string(),
        });
    }

    if !config.auth_key.is_configured() {
        return Err(ConfigError::Validation {
            message: "authKey is required".to_string(),
        });
    }

    match (&config.subscribe_key, &config.socket_cluster) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Validation {
                message: "subscribeKey and socketCluster are mutually exclusive".to_string(),
            });
        }
        (None, None) => {
            return Err(ConfigError::Validation {
                message: "one of subscribeKey or socketCluster is required".to_string(),
            });
        }
        (Some(key), None) if key.trim().is_empty() => {
            return Err(ConfigError::Validation {
                message: "subscribeKey must not be empty".to_string(),
            });
        }
        (None, Some(endpoint)) if endpoint.host.trim().is_empty() => {
            return Err(ConfigError::Validation {
                message: "socketCluster.host must not be empty".to_string(),
            });
        }
        _ => {}
    }

    if let Some(url) = &config.proxy_url {
        reqwest::Proxy::all(url.as_str()).map_err(|e| ConfigError::InvalidProxy {
            url: url.clone(),
            reason: e.to_string(),
        })?;
    }

    if config.status_capacity == 0 || config.message_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "statusCapacity and messageCapacity must be positive".to_string(),
        });
    }

    if config.last_message_received_at.is_some_and(|ts| ts < 0) {
        return Err(ConfigError::Validation {
            message: "lastMessageReceivedAt must be an epoch timestamp in milliseconds"
                .to_string(),
        });
    }

    Ok(())
}
