use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration, immutable once the server starts
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Port the application listens on (default: 3000)
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Port the proxy listens on (default: 4000, 0 picks a free port)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Bind address for the proxy listener (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// How long a request may wait for the app to respond, in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Quiet period of the scan debouncer in milliseconds (0 disables debouncing)
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Upper bound between forced scans while requests keep arriving (0 disables)
    #[serde(default = "default_debounce_ceiling")]
    pub debounce_ceiling_ms: u64,

    /// Pause between forward attempts while the app is not listening
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Directories to skip, matched exactly against the path relative to `root`
    #[serde(default = "default_ignore_dirs")]
    pub ignore: Vec<String>,

    /// Directory to watch for changes
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Shell used to run the command line
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Wait for the command to exit before serving requests
    #[serde(default)]
    pub wait: bool,

    /// Log extra debugging info
    #[serde(default)]
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_port: default_app_port(),
            proxy_port: default_proxy_port(),
            bind: default_bind_address(),
            timeout_ms: default_timeout(),
            debounce_ms: default_debounce(),
            debounce_ceiling_ms: default_debounce_ceiling(),
            retry_backoff_ms: default_retry_backoff(),
            ignore: default_ignore_dirs(),
            root: default_root(),
            shell: default_shell(),
            wait: false,
            verbose: false,
        }
    }
}

fn default_app_port() -> u16 {
    3000
}

fn default_proxy_port() -> u16 {
    4000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_timeout() -> u64 {
    10_000
}

fn default_debounce() -> u64 {
    200
}

fn default_debounce_ceiling() -> u64 {
    1_000
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_ignore_dirs() -> Vec<String> {
    ["node_modules", "log", "tmp", "vendor", ".make"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Config {
    /// Read and validate a config file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validating it, for callers that still
    /// apply overrides
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.app_port == 0 {
            errors.push("app_port must be non-zero".to_string());
        }
        if self.proxy_port != 0 && self.proxy_port == self.app_port {
            errors.push(format!(
                "proxy_port and app_port must differ (both are {})",
                self.app_port
            ));
        }
        if self.timeout_ms == 0 {
            errors.push("timeout_ms must be non-zero".to_string());
        }
        if self.retry_backoff_ms >= self.timeout_ms {
            errors.push(format!(
                "retry_backoff_ms ({}) must be below timeout_ms ({})",
                self.retry_backoff_ms, self.timeout_ms
            ));
        }
        if self.shell.is_empty() {
            errors.push("shell must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn debounce_ceiling(&self) -> Duration {
        Duration::from_millis(self.debounce_ceiling_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Ignore entries as relative paths, with `./` prefixes and trailing slashes removed
    pub fn ignore_paths(&self) -> Vec<PathBuf> {
        self.ignore
            .iter()
            .map(|dir| {
                let trimmed = dir.trim_end_matches('/');
                let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
                PathBuf::from(trimmed)
            })
            .filter(|p| !p.as_os_str().is_empty())
            .collect()
    }
}
