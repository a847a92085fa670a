use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};

/// Connection and sandbox defaults shared by every container a caller creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub app_name: String,
    pub time_limit_secs: u64,
    pub image: String,
    pub username: String,
    pub memory_limit: String, // Human readable, e.g. "4gb" or "536870912"
    pub env: BTreeMap<String, String>,
    pub host: String,
    pub api_version: String,
    pub cert_path: Option<String>,
    pub tls_verify: bool,
    pub hyper_q: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            app_name: "sandrun".to_string(),
            time_limit_secs: 60 * 60,
            image: "ubuntu".to_string(),
            username: "root".to_string(),
            memory_limit: "4gb".to_string(),
            env: BTreeMap::new(),
            host: "default".to_string(),
            api_version: "default".to_string(),
            cert_path: None,
            tls_verify: false,
            hyper_q: 1,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    docker: Option<HarnessConfig>,
}

impl HarnessConfig {
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| HarnessError::Config("Could not find config directory".to_string()))?;
        Ok(dir.join("sandrun").join("config.yml"))
    }

    /// Defaults, then the YAML file (if it exists), then `DOCKER_*` environment
    /// variables. A `.env` file in the working directory is loaded first.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        let mut config = if path.exists() {
            info!("Loading configuration from {:?}", path);
            Self::from_yaml(&fs::read_to_string(&path)?)?
        } else {
            debug!("No configuration file at {:?}, using defaults", path);
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        Ok(file.docker.unwrap_or_default())
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DOCKER_HOST").filter(|v| !v.is_empty()) {
            self.host = host;
        }
        if let Some(version) = lookup("DOCKER_API_VERSION").filter(|v| !v.is_empty()) {
            self.api_version = version;
        }
        if let Some(cert_path) = lookup("DOCKER_CERT_PATH").filter(|v| !v.is_empty()) {
            self.cert_path = Some(cert_path);
        }
        if let Some(verify) = lookup("DOCKER_TLS_VERIFY") {
            self.tls_verify = matches!(verify.as_str(), "1" | "true" | "TRUE" | "yes");
        }
    }

    pub fn time_limit(&self) -> Duration {
        Duration::from_secs(self.time_limit_secs)
    }

    pub fn memory_limit_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.memory_limit)
    }

    pub fn uses_default_host(&self) -> bool {
        self.host.is_empty() || self.host == "default"
    }
}

/// Parses "4gb", "512MiB", "1.5g" or a plain byte count.
pub fn parse_memory_limit(value: &str) -> Result<i64> {
    let value = value.trim().to_ascii_lowercase();
    if value.is_empty() {
        return Ok(0);
    }
    if let Ok(bytes) = value.parse::<i64>() {
        if bytes < 0 {
            return Err(HarnessError::Config(format!("Invalid memory limit: {value}")));
        }
        return Ok(bytes);
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| HarnessError::Config(format!("Invalid memory limit: {value}")))?;

    let multiplier: f64 = match unit.trim() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "m" | "mb" => 1e6,
        "g" | "gb" => 1e9,
        "t" | "tb" => 1e12,
        "ki" | "kib" => 1024.0,
        "mi" | "mib" => 1024.0 * 1024.0,
        "gi" | "gib" => 1024.0 * 1024.0 * 1024.0,
        "ti" | "tib" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(HarnessError::Config(format!(
                "Unknown memory unit '{other}' in {value}"
            )))
        }
    };

    Ok((number * multiplier) as i64)
}
