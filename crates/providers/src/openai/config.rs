use directories::BaseDirs;
use serde::Deserialize;
use std::{env, fs, path::PathBuf, time::Duration};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Clone, Debug, Deserialize)]
pub struct OpenAiFileConfig {
    pub model: Option<String>,
    pub request_timeout_ms: Option<u64>,
    pub stream_idle_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_enabled: Option<bool>,
}

#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Applies to buffered requests only; streams answer to the idle
    /// watchdog and cancellation instead.
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
    pub max_retries: u32,
    pub retry_enabled: bool,
    pub proxy: Option<String>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        OpenAiConfig {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_millis(30_000),
            stream_idle_timeout: Duration::from_millis(300_000),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_enabled: true,
            proxy: None,
        }
    }

    pub fn from_env_and_file() -> anyhow::Result<Self> {
        let api_key =
            env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let mut cfg = Self::new(api_key);
        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            cfg.base_url = base_url;
        }

        if let Some(path) = Self::config_path() {
            if path.exists() {
                if let Ok(raw) = fs::read_to_string(&path) {
                    if let Ok(file_cfg) = toml::from_str::<OpenAiFileConfig>(&raw) {
                        cfg.apply_file(file_cfg);
                    }
                }
            }
        }

        cfg.proxy = env::var("HTTPS_PROXY")
            .ok()
            .or_else(|| env::var("HTTP_PROXY").ok());

        Ok(cfg)
    }

    fn apply_file(&mut self, file: OpenAiFileConfig) {
        if let Some(m) = file.model {
            self.model = m;
        }
        if let Some(t) = file.request_timeout_ms {
            self.request_timeout = Duration::from_millis(t);
        }
        if let Some(idle) = file.stream_idle_timeout_ms {
            self.stream_idle_timeout = Duration::from_millis(idle);
        }
        if let Some(r) = file.max_retries {
            self.max_retries = r;
        }
        if let Some(e) = file.retry_enabled {
            self.retry_enabled = e;
        }
    }

    fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        let p = if cfg!(target_os = "windows") {
            base.home_dir().join(".relay").join("config.toml")
        } else {
            base.config_dir().join("relay").join("config.toml")
        };
        Some(p)
    }
}
