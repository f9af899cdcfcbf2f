use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use frame_rpc::BridgeConfig;
use frame_rpc::discovery::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};

// =============================================================================
// File config (figment-deserialized from defaults / frame-sync.toml / env vars)
// =============================================================================
//
//   frame-sync.toml:  [bridge]
//                     call_timeout_ms = 2000
//
//   env var:          FRAME_SYNC_BRIDGE__CALL_TIMEOUT_MS=2000   (double underscore = nesting)

pub const CONFIG_FILE: &str = "frame-sync.toml";
pub const ENV_PREFIX: &str = "FRAME_SYNC_";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub sync: SyncSectionFileConfig,
    #[serde(default)]
    pub discovery: DiscoveryFileConfig,
}

/// Lives under `[bridge]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeFileConfig {
    /// How long a fan-out call waits for each guest.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Lives under `[sync]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncSectionFileConfig {
    /// Quiet period before coalesced anchoring results are applied.
    #[serde(default = "default_anchor_debounce_ms")]
    pub anchor_debounce_ms: u64,
}

impl Default for SyncSectionFileConfig {
    fn default() -> Self {
        Self {
            anchor_debounce_ms: default_anchor_debounce_ms(),
        }
    }
}

/// Lives under `[discovery]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFileConfig {
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for DiscoveryFileConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            namespace: default_namespace(),
        }
    }
}

fn default_call_timeout_ms() -> u64 {
    1000
}
fn default_anchor_debounce_ms() -> u64 {
    10
}
fn default_origin() -> String {
    "*".to_string()
}
fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Layers: defaults → `frame-sync.toml` (or `path`) → `FRAME_SYNC_*` env vars.
pub fn load_config(path: Option<&Path>) -> Figment {
    let file = path.unwrap_or(Path::new(CONFIG_FILE));
    Figment::from(Serialized::defaults(SyncFileConfig::default()))
        .merge(Toml::file(file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

// =============================================================================
// Runtime view
// =============================================================================

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub bridge: BridgeConfig,
    pub anchor_debounce: Duration,
    /// Target origin for discovery beacons.
    pub discovery_origin: String,
    pub namespace: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&SyncFileConfig::default())
    }
}

impl SyncConfig {
    pub fn from_file(fc: &SyncFileConfig) -> Self {
        Self {
            bridge: BridgeConfig {
                call_timeout: Duration::from_millis(fc.bridge.call_timeout_ms),
            },
            anchor_debounce: Duration::from_millis(fc.sync.anchor_debounce_ms),
            discovery_origin: fc.discovery.origin.clone(),
            namespace: fc.discovery.namespace.clone(),
        }
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc: SyncFileConfig = load_config(path)
            .extract()
            .context("Failed to load frame-sync configuration")?;
        Ok(Self::from_file(&fc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_config_defaults() {
        let d = SyncFileConfig::default();
        assert_eq!(d.bridge.call_timeout_ms, 1000);
        assert_eq!(d.sync.anchor_debounce_ms, 10);
        assert_eq!(d.discovery.origin, "*");
        assert_eq!(d.discovery.namespace, "cross_frame");
    }

    #[test]
    fn test_sync_config_from_file() {
        let fc = SyncFileConfig {
            bridge: BridgeFileConfig {
                call_timeout_ms: 250,
            },
            sync: SyncSectionFileConfig {
                anchor_debounce_ms: 40,
            },
            discovery: DiscoveryFileConfig {
                origin: "https://sidebar.example".into(),
                namespace: "annotator".into(),
            },
        };
        let sc = SyncConfig::from_file(&fc);
        assert_eq!(sc.bridge.call_timeout, Duration::from_millis(250));
        assert_eq!(sc.anchor_debounce, Duration::from_millis(40));
        assert_eq!(sc.discovery_origin, "https://sidebar.example");
        assert_eq!(sc.namespace, "annotator");
    }

    #[test]
    fn test_load_from_toml_keeps_unset_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame-sync.toml");
        std::fs::write(&path, "[sync]\nanchor_debounce_ms = 25\n").unwrap();

        let fc: SyncFileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.sync.anchor_debounce_ms, 25);
        assert_eq!(fc.bridge.call_timeout_ms, 1000);
        assert_eq!(fc.discovery, DiscoveryFileConfig::default());
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let sc = SyncConfig::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(sc.bridge.call_timeout, frame_rpc::DEFAULT_CALL_TIMEOUT);
    }

    #[test]
    fn test_malformed_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame-sync.toml");
        std::fs::write(&path, "[bridge]\ncall_timeout_ms = \"soon\"\n").unwrap();
        assert!(SyncConfig::load(Some(&path)).is_err());
    }
}
