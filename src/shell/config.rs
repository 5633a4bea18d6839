use std::path::PathBuf;

/// Environment variable prefix for all supervisor settings.
const ENV_PREFIX: &str = "LLM_SHELL_";

#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Per-run log files live here, relative to the supervisor's CWD.
    pub log_dir: PathBuf,
    /// Default graceful window for `/restart` when no `timeout` is given.
    pub restart_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8776
}
fn default_log_dir() -> PathBuf {
    "logs".into()
}
fn default_restart_timeout_secs() -> u64 {
    10
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_dir: default_log_dir(),
            restart_timeout_secs: default_restart_timeout_secs(),
        }
    }
}

impl Settings {
    /// Start from defaults and overlay `LLM_SHELL_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(host) = env_var("HOST") {
            cfg.host = host;
        }
        if let Some(raw) = env_var("PORT") {
            cfg.port = raw
                .parse::<u16>()
                .map_err(|e| anyhow::anyhow!("invalid {ENV_PREFIX}PORT {raw:?}: {e}"))?;
        }
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
