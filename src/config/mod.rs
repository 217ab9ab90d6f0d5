use crate::ipc::validate_token;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "ani-ipc.toml";
const ENV_PREFIX: &str = "ANI_IPC_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub token: String,
    /// Pool size; 0 means one worker per hardware thread.
    pub workers: usize,
    /// 0 keeps reads and writes fully blocking.
    pub io_timeout_ms: u64,
    pub exit_on_disconnect: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            token: "echo-service".to_string(),
            workers: 0,
            io_timeout_ms: 0,
            exit_on_disconnect: false,
        }
    }
}

impl ServerConfig {
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 20,
            retry_delay_ms: 250,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::from_file(&active_config_path())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    // A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str::<Config>(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}TOKEN", ENV_PREFIX)) {
            self.server.token = val;
        }
        if let Ok(val) = env::var(format!("{}WORKERS", ENV_PREFIX)) {
            if let Ok(workers) = val.parse() {
                self.server.workers = workers;
            }
        }
        if let Ok(val) = env::var(format!("{}IO_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.server.io_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}EXIT_ON_DISCONNECT", ENV_PREFIX)) {
            self.server.exit_on_disconnect = val.parse().unwrap_or(false);
        }
        if let Ok(val) = env::var(format!("{}CONNECT_ATTEMPTS", ENV_PREFIX)) {
            if let Ok(attempts) = val.parse() {
                self.client.connect_attempts = attempts;
            }
        }
        if let Ok(val) = env::var(format!("{}RETRY_DELAY_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.client.retry_delay_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        validate_token(&self.server.token)
            .map_err(|err| format!("server.token is not usable: {err}"))?;
        if self.client.connect_attempts == 0 {
            return Err("client.connect_attempts must be at least 1".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        active_config_path()
    }
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        return local;
    }
    env::var(format!("{}CONFIG_PATH", ENV_PREFIX))
        .map(PathBuf::from)
        .unwrap_or(local)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.server.token, "echo-service");
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let parsed: Config = toml::from_str("[server]\ntoken = \"thumbnail-service\"\n").unwrap();
        assert_eq!(parsed.server.token, "thumbnail-service");
        assert_eq!(parsed.server.workers, 0);
        assert_eq!(parsed.client.connect_attempts, 20);
    }

    #[test]
    fn validate_rejects_bad_token_and_zero_attempts() {
        let mut cfg = Config::default();
        cfg.server.token = String::new();
        assert!(cfg.validate().is_err());
        cfg.server.token = "a/b".to_string();
        assert!(cfg.validate().is_err());
        cfg.server.token = "ok".to_string();
        cfg.client.connect_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn io_timeout_zero_means_none() {
        let mut cfg = ServerConfig::default();
        assert_eq!(cfg.io_timeout(), None);
        cfg.io_timeout_ms = 1500;
        assert_eq!(cfg.io_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::from_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.server.token, ServerConfig::default().token);
    }

    #[test]
    fn write_default_creates_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        Config::write_default(&path).unwrap();
        let cfg = Config::from_file(&path).unwrap();
        cfg.validate().unwrap();
        assert!(Config::write_default(&path).is_err());
    }
}
