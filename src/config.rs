use serde::Deserialize;

use crate::circuit::{DEFAULT_CIRCUITS, MAX_CIRCUITS};
use crate::smb::packet_pool::{ALLOCATE_WAIT, DEFAULT_MAX_OVERSIZED};

/// Server configuration loaded from TOML file.
/// See config.toml.example for format.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// TCP port to listen on (default 445, use 4450 for non-root)
    pub port: u16,
    /// Server name, used in log output
    pub server_name: String,
    /// Packet buffer pool
    #[serde(default)]
    pub pool: PoolConfig,
    /// Virtual circuits allowed per session (1-16)
    #[serde(default = "default_max_circuits")]
    pub max_virtual_circuits: usize,
}

/// One buffer size class of the packet pool.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassConfig {
    pub size: usize,
    pub count: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Size classes in ascending size order
    #[serde(default = "default_size_classes")]
    pub size_classes: Vec<SizeClassConfig>,
    /// How long an allocation waits for a free buffer
    #[serde(default = "default_allocate_wait_ms")]
    pub allocate_wait_ms: u64,
    /// Serve requests larger than every size class from unpooled memory
    #[serde(default = "default_true")]
    pub allow_oversized: bool,
    /// Largest unpooled allocation
    #[serde(default = "default_max_oversized")]
    pub max_oversized: usize,
}

impl PoolConfig {
    pub fn classes(&self) -> Vec<(usize, usize)> {
        self.size_classes.iter().map(|c| (c.size, c.count)).collect()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            size_classes: default_size_classes(),
            allocate_wait_ms: default_allocate_wait_ms(),
            allow_oversized: true,
            max_oversized: DEFAULT_MAX_OVERSIZED,
        }
    }
}

fn default_size_classes() -> Vec<SizeClassConfig> {
    [(256, 40), (4096, 20), (16384, 10), (66000, 4)]
        .into_iter()
        .map(|(size, count)| SizeClassConfig { size, count })
        .collect()
}

fn default_allocate_wait_ms() -> u64 {
    ALLOCATE_WAIT.as_millis() as u64
}

fn default_true() -> bool {
    true
}

fn default_max_oversized() -> usize {
    DEFAULT_MAX_OVERSIZED
}

fn default_max_circuits() -> usize {
    DEFAULT_CIRCUITS
}

/// Load and parse the TOML configuration file.
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
    let config: Config = toml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path, e))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
    let classes = &config.pool.size_classes;
    if classes.is_empty() {
        anyhow::bail!("No packet pool size classes configured");
    }
    if classes.windows(2).any(|w| w[0].size >= w[1].size) {
        anyhow::bail!("Packet pool size classes must be in ascending size order");
    }
    if let Some(c) = classes.iter().find(|c| c.size == 0 || c.count == 0) {
        anyhow::bail!("Invalid packet pool size class {}x{}", c.size, c.count);
    }
    if !(1..=MAX_CIRCUITS).contains(&config.max_virtual_circuits) {
        anyhow::bail!(
            "max_virtual_circuits must be between 1 and {}, got {}",
            MAX_CIRCUITS,
            config.max_virtual_circuits
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            port = 4450
            server_name = "test"
            max_virtual_circuits = 8
            [pool]
            allocate_wait_ms = 100
            allow_oversized = false
            [[pool.size_classes]]
            size = 256
            count = 4
            [[pool.size_classes]]
            size = 4096
            count = 2
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port, 4450);
        assert_eq!(config.max_virtual_circuits, 8);
        assert_eq!(config.pool.classes(), vec![(256, 4), (4096, 2)]);
        assert_eq!(config.pool.allocate_wait_ms, 100);
        assert!(!config.pool.allow_oversized);
        assert_eq!(config.pool.max_oversized, DEFAULT_MAX_OVERSIZED);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("port = 445\nserver_name = \"srv\"").unwrap();
        assert_eq!(config.max_virtual_circuits, DEFAULT_CIRCUITS);
        assert_eq!(config.pool.allocate_wait_ms, 250);
        assert!(config.pool.allow_oversized);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config: Config = toml::from_str("port = 445\nserver_name = \"srv\"").unwrap();
        config.max_virtual_circuits = 17;
        assert!(validate(&config).is_err());

        config.max_virtual_circuits = 4;
        config.pool.size_classes.swap(0, 1);
        assert!(validate(&config).is_err());

        config.pool.size_classes.clear();
        assert!(validate(&config).is_err());
    }
}
