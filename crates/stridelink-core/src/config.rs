//! Coordinator configuration: device identities, retry policy, scan mode.
//!
//! Advertised names vary across firmware revisions (e.g.
//! `"ESP32-S3 BLE Shoe left"` vs `"ESP32-S3 BLE left shoes"`), so both
//! names and the per-role GATT identifiers are configuration, not
//! constants. Defaults carry the values the reference firmware ships with.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::{uuid, Uuid};

use crate::error::ConfigError;
use crate::types::Role;

/// Client Characteristic Configuration descriptor, the fixed well-known
/// identifier used to enable notifications on any characteristic.
pub const CCCD_UUID: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// GATT identity of one shoe peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Advertised device name; matched exactly, never by prefix.
    pub name: String,
    /// Primary service exposing the sensor characteristics.
    pub service: Uuid,
    /// Characteristic streaming framed JSON notifications.
    pub notify: Uuid,
    /// Command characteristic, when the firmware exposes one. Some
    /// revisions have no write channel; the role then simply cannot
    /// receive start/stop/measure commands.
    pub write: Option<Uuid>,
}

impl DeviceIdentity {
    /// Exact advertised-name match.
    #[must_use]
    pub fn matches(&self, advertised: &str) -> bool {
        self.name == advertised
    }
}

/// How the two roles are brought up during a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Connect either role as soon as its advertisement is seen.
    #[default]
    Concurrent,
    /// Connect left first; delay the right connect by a grace period
    /// after left reaches `Ready`. Avoids simultaneous-connection radio
    /// contention on constrained peripherals.
    Sequential,
}

/// Full coordinator configuration for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Left-shoe identity.
    pub left: DeviceIdentity,
    /// Right-shoe identity.
    pub right: DeviceIdentity,
    /// MTU requested after connect. The default 23-byte MTU cannot carry
    /// one JSON frame, so negotiation always precedes discovery; a smaller
    /// grant is accepted best-effort.
    pub mtu_target: u16,
    /// Per-attempt scan deadline in milliseconds.
    pub scan_timeout_ms: u64,
    /// Maximum scan attempts per measurement before the terminal failure.
    pub max_scan_attempts: u32,
    /// Concurrent or sequential bring-up.
    pub scan_mode: ScanMode,
    /// Delay before the right connect in sequential mode, milliseconds.
    pub sequential_grace_ms: u64,
    /// Enable the periodic `measure` command pump once both roles are
    /// ready. Needed for firmware that must be polled.
    pub command_pump: bool,
    /// Command pump period in milliseconds.
    pub command_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            left: DeviceIdentity {
                name: "ESP32-S3 BLE left shoes".into(),
                service: uuid!("12345678-1234-5678-1234-56789abcdef0"),
                notify: uuid!("abcdef01-1234-5678-1234-56789abcdef0"),
                write: Some(uuid!("abcdef02-1234-5678-1234-56789abcdef0")),
            },
            right: DeviceIdentity {
                name: "ESP32-S3 BLE right shoes".into(),
                service: uuid!("87654321-4321-6789-4321-0fedcba98765"),
                notify: uuid!("fedcba01-4321-6789-4321-0fedcba98765"),
                write: Some(uuid!("fedcba02-4321-6789-4321-0fedcba98765")),
            },
            mtu_target: 256,
            scan_timeout_ms: 5_000,
            max_scan_attempts: 3,
            scan_mode: ScanMode::Concurrent,
            sequential_grace_ms: 500,
            command_pump: false,
            command_interval_ms: 1_000,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed configuration fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the filesystem write fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.display().to_string(),
                source,
            })?;
        }
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check invariants the coordinator relies on.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.left.name.trim().is_empty() || self.right.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                message: "advertised device names must not be empty".into(),
            });
        }
        if self.left.name == self.right.name {
            return Err(ConfigError::Invalid {
                field: "name",
                message: "left and right advertised names must differ".into(),
            });
        }
        if self.left.service == self.right.service {
            return Err(ConfigError::Invalid {
                field: "service",
                message: "left and right service UUIDs must differ".into(),
            });
        }
        if self.max_scan_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "max_scan_attempts",
                message: "at least one scan attempt is required".into(),
            });
        }
        if self.scan_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "scan_timeout_ms",
                message: "scan timeout must be nonzero".into(),
            });
        }
        if self.command_pump && self.command_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "command_interval_ms",
                message: "command pump interval must be nonzero".into(),
            });
        }
        Ok(())
    }

    /// The identity configured for `role`.
    #[must_use]
    pub const fn identity(&self, role: Role) -> &DeviceIdentity {
        match role {
            Role::Left => &self.left,
            Role::Right => &self.right,
        }
    }

    /// Map an advertised name to a role, if it matches either identity
    /// exactly. Any other name is ignored by the coordinator.
    #[must_use]
    pub fn role_for(&self, advertised: &str) -> Option<Role> {
        if self.left.matches(advertised) {
            Some(Role::Left)
        } else if self.right.matches(advertised) {
            Some(Role::Right)
        } else {
            None
        }
    }

    /// Per-attempt scan deadline.
    #[must_use]
    pub const fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    /// Right-connect delay in sequential mode.
    #[must_use]
    pub const fn sequential_grace(&self) -> Duration {
        Duration::from_millis(self.sequential_grace_ms)
    }

    /// Command pump period.
    #[must_use]
    pub const fn command_interval(&self) -> Duration {
        Duration::from_millis(self.command_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        config.validate().expect("default config must validate");
        assert_eq!(config.mtu_target, 256);
        assert_eq!(config.scan_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_scan_attempts, 3);
    }

    #[test]
    fn role_matching_is_exact() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.role_for("ESP32-S3 BLE left shoes"), Some(Role::Left));
        assert_eq!(
            config.role_for("ESP32-S3 BLE right shoes"),
            Some(Role::Right)
        );
        // Prefixes and firmware variants of the name do not match.
        assert_eq!(config.role_for("ESP32-S3 BLE left"), None);
        assert_eq!(config.role_for("ESP32-S3 BLE left shoes "), None);
        assert_eq!(config.role_for(""), None);
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stridelink.toml");

        let mut config = CoordinatorConfig::default();
        config.scan_mode = ScanMode::Sequential;
        config.left.name = "ESP32-S3 BLE Shoe left".into();
        config.left.write = None;
        config.save(&path).expect("save");

        let loaded = CoordinatorConfig::load(&path).expect("load");
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = CoordinatorConfig::load(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(loaded, CoordinatorConfig::default());
    }

    #[test]
    fn validation_rejects_duplicate_names() {
        let mut config = CoordinatorConfig::default();
        config.right.name.clone_from(&config.left.name);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_budget() {
        let mut config = CoordinatorConfig::default();
        config.max_scan_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn cccd_is_the_well_known_descriptor() {
        assert_eq!(
            CCCD_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
