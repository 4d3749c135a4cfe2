//! Configuration surface.
//!
//! Models the device's read-only key/value store as a typed config, loaded
//! from an optional TOML file with `MESHCACHE_` environment overrides
//! (e.g. `MESHCACHE_ROUTER__SSID`). Router credentials are required for mesh
//! operation; everything else has a default. The upstream certificate is
//! optional; absent means "use the platform's trusted CA store".

use crate::peers::MeshAddress;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key: {0}")]
    MissingKey(&'static str),

    #[error("invalid config: {0}")]
    Invalid(#[from] Box<figment::Error>),
}

/// Upstream-router (external network) credentials. Required on any node that
/// may become root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub passwd: String,
    /// Fixed channel, if the deployment pins one.
    #[serde(default)]
    pub channel: Option<u8>,
}

/// The softap identity this node advertises to prospective children.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApConfig {
    #[serde(default = "default_ap_ssid")]
    pub ssid: String,
    #[serde(default)]
    pub passwd: String,
}

impl Default for ApConfig {
    fn default() -> Self {
        ApConfig {
            ssid: default_ap_ssid(),
            passwd: String::new(),
        }
    }
}

/// Binary-cache settings: what `/nix-cache-info` reports and where the root
/// forwards misses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_store")]
    pub store: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Port on the upstream origin; defaults to 443/80 by scheme.
    #[serde(default)]
    pub upstream_port: Option<u16>,
    #[serde(default = "default_true")]
    pub use_https: bool,
    /// Pinned PEM certificate for the upstream. None = platform CA store.
    #[serde(default)]
    pub cert: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            store: default_store(),
            priority: default_priority(),
            upstream: default_upstream(),
            upstream_port: None,
            use_https: true,
            cert: None,
        }
    }
}

/// Mesh tuning knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Start mesh + HTTP automatically at boot.
    #[serde(default = "default_true")]
    pub boot_mesh: bool,
    /// Statically pin this node to the root role.
    #[serde(default)]
    pub pin_root: bool,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_rssi_floor")]
    pub rssi_floor_dbm: i8,
    /// Routing-table / peer-table bound.
    #[serde(default = "default_peer_capacity")]
    pub peer_capacity: usize,
    /// Child associations this node will accept.
    #[serde(default = "default_max_children")]
    pub max_children: u8,
    /// Deepest layer a child-bearing node may occupy.
    #[serde(default = "default_max_layer")]
    pub max_layer: i32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            boot_mesh: true,
            pin_root: false,
            ping_interval_secs: default_ping_interval(),
            rssi_floor_dbm: default_rssi_floor(),
            peer_capacity: default_peer_capacity(),
            max_children: default_max_children(),
            max_layer: default_max_layer(),
        }
    }
}

/// Complete node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub ap: ApConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub mesh: MeshConfig,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Concurrent HTTP requests accepted before refusing.
    #[serde(default = "default_max_inflight")]
    pub max_inflight_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            router: RouterConfig::default(),
            ap: ApConfig::default(),
            cache: CacheConfig::default(),
            mesh: MeshConfig::default(),
            http_port: default_http_port(),
            max_inflight_requests: default_max_inflight(),
        }
    }
}

fn default_ap_ssid() -> String {
    "meshcache".to_string()
}

fn default_store() -> String {
    "/nix/store".to_string()
}

fn default_priority() -> u32 {
    30
}

fn default_upstream() -> String {
    "cache.nixos.org".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    30
}

fn default_rssi_floor() -> i8 {
    -70
}

fn default_peer_capacity() -> usize {
    12
}

fn default_max_children() -> u8 {
    10
}

fn default_max_layer() -> i32 {
    6
}

fn default_http_port() -> u16 {
    1008
}

fn default_max_inflight() -> usize {
    8
}

impl Config {
    /// Load from an optional TOML file, then apply `MESHCACHE_` env
    /// overrides (`__` separates nesting levels).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed("MESHCACHE_").split("__"))
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }

    /// Startup validation: mesh operation needs router credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh.boot_mesh {
            if self.router.ssid.is_empty() {
                return Err(ConfigError::MissingKey("router.ssid"));
            }
            if self.router.passwd.is_empty() {
                return Err(ConfigError::MissingKey("router.passwd"));
            }
        }
        Ok(())
    }

    /// The softap SSID advertised to children: the configured base with the
    /// low three bytes of this node's address appended, keeping sibling
    /// devices distinguishable.
    pub fn softap_ssid(&self, addr: MeshAddress) -> String {
        let [.., d, e, f] = addr.0;
        format!("{}_{d:02x}{e:02x}{f:02x}", self.ap.ssid)
    }

    /// Config for tests: loopback-friendly, no required credentials.
    pub fn for_testing() -> Self {
        Config {
            router: RouterConfig {
                ssid: "testnet".into(),
                passwd: "testpasswd".into(),
                channel: None,
            },
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::providers::{Format, Toml};

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = Figment::from(Toml::string(
            r#"
            [router]
            ssid = "vegas"
            passwd = "rebuild-the-world"
            "#,
        ))
        .extract()
        .unwrap();
        assert_eq!(config.http_port, 1008);
        assert_eq!(config.cache.store, "/nix/store");
        assert_eq!(config.cache.priority, 30);
        assert_eq!(config.mesh.ping_interval_secs, 30);
        assert_eq!(config.mesh.rssi_floor_dbm, -70);
        assert!(config.cache.use_https);
        assert!(config.cache.cert.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn missing_router_credentials_fail_validation() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingKey("router.ssid"))
        ));

        let mut no_mesh = Config::default();
        no_mesh.mesh.boot_mesh = false;
        no_mesh.validate().unwrap();
    }

    #[test]
    fn constructed_defaults_match_deserialized_defaults() {
        // Default and serde's field defaults must agree, or a plain
        // Config::default() ships a dead proxy.
        for config in [Config::default(), Config::for_testing()] {
            assert_eq!(config.http_port, 1008);
            assert_eq!(config.max_inflight_requests, 8);
            assert!(config.max_inflight_requests > 0);
        }
        let from_toml: Config = Figment::from(Toml::string("")).extract().unwrap();
        assert_eq!(from_toml.http_port, Config::default().http_port);
        assert_eq!(
            from_toml.max_inflight_requests,
            Config::default().max_inflight_requests
        );
    }

    #[test]
    fn softap_ssid_carries_address_suffix() {
        let config = Config::for_testing();
        let addr: MeshAddress = "a4:cf:12:9b:01:ff".parse().unwrap();
        assert_eq!(config.softap_ssid(addr), "meshcache_9b01ff");
    }
}
