use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::node::NodeOptions;
use crate::playback::coordinator::MAX_VOLUME;

#[derive(Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Nodos de audio
    pub nodes: Vec<NodeOptions>,
    pub ping_interval: Duration,
    pub load_timeout: Duration,
    pub resume_timeout_secs: u64,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,

    // Sesiones de voz
    pub handshake_timeout: Duration,
    pub ready_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub move_settle_timeout: Duration,
    pub self_deaf: bool,

    // Reproducción
    pub default_volume: u16,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("No se pudo crear {}", config.data_dir.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from any key lookup, the process environment
    /// in production.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let duration = |key: &str, default: Duration| -> Result<Duration> {
            match var(key) {
                Some(value) => humantime::parse_duration(value.trim())
                    .with_context(|| format!("{key} no es una duración válida: {value}")),
                None => Ok(default),
            }
        };

        let nodes = match var("LAVALINK_NODES") {
            Some(json) => serde_json::from_str(&json).context("LAVALINK_NODES no es un JSON válido")?,
            None => vec![NodeOptions {
                url: format!(
                    "{}:{}",
                    var("LAVALINK_HOST").unwrap_or_else(|| "localhost".to_string()),
                    var("LAVALINK_PORT").unwrap_or_else(|| "2333".to_string())
                ),
                password: var("LAVALINK_PASSWORD").unwrap_or_else(|| "youshallnotpass".to_string()),
                ws_secure: false,
                rest_secure: false,
                region: var("LAVALINK_REGION").unwrap_or_else(|| "us".to_string()),
            }],
        };

        Ok(Self {
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN no definido")?,

            nodes,
            ping_interval: duration("PING_INTERVAL", defaults.ping_interval)?,
            load_timeout: duration("LOAD_TIMEOUT", defaults.load_timeout)?,
            resume_timeout_secs: var("RESUME_TIMEOUT_SECS")
                .map(|v| v.parse())
                .transpose()
                .context("RESUME_TIMEOUT_SECS inválido")?
                .unwrap_or(defaults.resume_timeout_secs),
            reconnect_base_delay: duration("RECONNECT_BASE_DELAY", defaults.reconnect_base_delay)?,
            reconnect_max_delay: duration("RECONNECT_MAX_DELAY", defaults.reconnect_max_delay)?,
            max_reconnect_attempts: var("MAX_RECONNECT_ATTEMPTS")
                .map(|v| v.parse())
                .transpose()
                .context("MAX_RECONNECT_ATTEMPTS inválido")?
                .unwrap_or(defaults.max_reconnect_attempts),

            handshake_timeout: duration("HANDSHAKE_TIMEOUT", defaults.handshake_timeout)?,
            ready_timeout: duration("READY_TIMEOUT", defaults.ready_timeout)?,
            disconnect_timeout: duration("DISCONNECT_TIMEOUT", defaults.disconnect_timeout)?,
            move_settle_timeout: duration("MOVE_SETTLE_TIMEOUT", defaults.move_settle_timeout)?,
            self_deaf: var("SELF_DEAF")
                .map(|v| v.parse())
                .transpose()
                .context("SELF_DEAF debe ser true o false")?
                .unwrap_or(defaults.self_deaf),

            default_volume: var("DEFAULT_VOLUME")
                .map(|v| v.parse())
                .transpose()
                .context("DEFAULT_VOLUME inválido")?
                .unwrap_or(defaults.default_volume),

            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
        })
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 1000
    /// - At least one node, each with a bare `host:port`
    /// - Timeouts and reconnect delays must be non-zero
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > MAX_VOLUME {
            anyhow::bail!("Default volume must be between 0 and {}, got: {}", MAX_VOLUME, self.default_volume);
        }

        if self.nodes.is_empty() {
            anyhow::bail!("At least one Lavalink node must be configured");
        }

        for node in &self.nodes {
            if node.url.is_empty() || node.url.contains("://") {
                anyhow::bail!("Node url must be host:port without scheme, got: {:?}", node.url);
            }
        }

        let timeouts = [
            ("HANDSHAKE_TIMEOUT", self.handshake_timeout),
            ("READY_TIMEOUT", self.ready_timeout),
            ("DISCONNECT_TIMEOUT", self.disconnect_timeout),
            ("LOAD_TIMEOUT", self.load_timeout),
            ("PING_INTERVAL", self.ping_interval),
            ("RECONNECT_BASE_DELAY", self.reconnect_base_delay),
        ];
        for (key, value) in timeouts {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", key);
            }
        }

        if self.reconnect_base_delay > self.reconnect_max_delay {
            anyhow::bail!(
                "RECONNECT_BASE_DELAY ({}) cannot exceed RECONNECT_MAX_DELAY ({})",
                humantime::format_duration(self.reconnect_base_delay),
                humantime::format_duration(self.reconnect_max_delay)
            );
        }

        if self.max_reconnect_attempts == 0 {
            anyhow::bail!("Max reconnect attempts must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging, without
    /// tokens or node passwords.
    pub fn summary(&self) -> String {
        let nodes: Vec<String> = self
            .nodes
            .iter()
            .map(|node| format!("{} ({})", node.url, if node.region.is_empty() { "-" } else { node.region.as_str() }))
            .collect();

        format!(
            "Config Summary:\n  \
            Nodes: {}\n  \
            Voice: handshake {}, ready {}, self_deaf={}\n  \
            Resume: {}s window, {} reconnect attempts\n  \
            Playback: {} vol, data en {}",
            nodes.join(", "),
            humantime::format_duration(self.handshake_timeout),
            humantime::format_duration(self.ready_timeout),
            self.self_deaf,
            self.resume_timeout_secs,
            self.max_reconnect_attempts,
            self.default_volume,
            self.data_dir.display()
        )
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("nodes", &self.nodes.len())
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin defaults)
            discord_token: String::new(),

            nodes: Vec::new(),
            ping_interval: Duration::from_secs(5),
            load_timeout: Duration::from_secs(30),
            resume_timeout_secs: 300,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,

            handshake_timeout: Duration::from_secs(120),
            ready_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(10),
            move_settle_timeout: Duration::from_secs(3),
            self_deaf: true,

            default_volume: 100,

            data_dir: "./data".into(),
        }
    }
}
