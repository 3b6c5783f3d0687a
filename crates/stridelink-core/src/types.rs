//! Shared types: roles, connection states, and decoded sensor frames.

use serde::{Deserialize, Serialize};

/// Which physical shoe a session or sample belongs to.
///
/// Fixed at session creation from the matched advertised device name and
/// immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The left shoe peripheral.
    Left,
    /// The right shoe peripheral.
    Right,
}

impl Role {
    /// Both roles, left first.
    pub const ALL: [Self; 2] = [Self::Left, Self::Right];

    /// Lowercase label used in logs and published state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }

    /// The opposite role.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one peripheral connection.
///
/// Forward progress is strictly
/// `Disconnected → Scanning → Connecting → MtuNegotiating →
/// DiscoveringServices → Subscribing → Ready`; any state may fall back to
/// `Disconnected` on an abrupt disconnect, and a graceful stop passes
/// through `Disconnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No connection and no scan in progress for this role.
    #[default]
    Disconnected,
    /// The coordinator is scanning for this role's advertised name.
    Scanning,
    /// A matching advertisement was seen and a connect was requested.
    Connecting,
    /// Link is up; waiting for the MTU exchange to complete.
    MtuNegotiating,
    /// MTU settled; waiting for GATT service discovery results.
    DiscoveringServices,
    /// Service located; waiting for the notification subscription to
    /// become active (CCCD descriptor write).
    Subscribing,
    /// Handshake complete; notifications flow and writes are legal.
    Ready,
    /// Graceful teardown in progress.
    Disconnecting,
}

impl ConnectionState {
    /// Whether characteristic writes are legal in this state.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::MtuNegotiating => "mtu-negotiating",
            Self::DiscoveringServices => "discovering-services",
            Self::Subscribing => "subscribing",
            Self::Ready => "ready",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

/// Number of force-sensing-resistor pads per shoe.
pub const FSR_PAD_COUNT: usize = 5;

/// One decoded JSON payload from a notification.
///
/// Frames are partial by design: whichever fields were present in the JSON
/// object are populated, the rest stay `None`. Absence is always expressed
/// through `Option`, never through a sentinel value, so a legitimate `0.0`
/// reading stays distinguishable from "not reported".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorFrame {
    /// Roll angle in degrees.
    pub roll: Option<f64>,
    /// Yaw angle in degrees.
    pub yaw_angle: Option<f64>,
    /// Yaw angular rate.
    pub yaw_rate: Option<f64>,
    /// Short posture label reported by the firmware (e.g. `"good"`).
    pub squat_posture: Option<String>,
    /// Left-shoe pressure pads, one value per pad, in pad order.
    pub fsr_left: Option<[u32; FSR_PAD_COUNT]>,
    /// Right-shoe pressure pads, one value per pad, in pad order.
    pub fsr_right: Option<[u32; FSR_PAD_COUNT]>,
    /// Unsplit pressure array sent by single-peripheral firmware revisions.
    pub fsr: Option<Vec<u32>>,
    /// Roll angle nested under the `imu` object in newer firmware.
    pub imu_roll: Option<f64>,
}

impl SensorFrame {
    /// `true` when no recognized field was present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge `newer` into `self` additively.
    ///
    /// Fields present in `newer` replace the stored value; absent fields
    /// never clobber previously known values.
    pub fn merge(&mut self, newer: &Self) {
        if let Some(v) = newer.roll {
            self.roll = Some(v);
        }
        if let Some(v) = newer.yaw_angle {
            self.yaw_angle = Some(v);
        }
        if let Some(v) = newer.yaw_rate {
            self.yaw_rate = Some(v);
        }
        if let Some(v) = &newer.squat_posture {
            self.squat_posture = Some(v.clone());
        }
        if let Some(v) = newer.fsr_left {
            self.fsr_left = Some(v);
        }
        if let Some(v) = newer.fsr_right {
            self.fsr_right = Some(v);
        }
        if let Some(v) = &newer.fsr {
            self.fsr = Some(v.clone());
        }
        if let Some(v) = newer.imu_roll {
            self.imu_roll = Some(v);
        }
    }
}

/// Published per-role state surface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoleState {
    /// Current connection lifecycle state.
    pub state: ConnectionState,
    /// Latest merged sensor fields for this role.
    pub frame: SensorFrame,
    /// Human-readable description of the last role-level error, if any.
    pub last_error: Option<String>,
}

impl RoleState {
    /// `true` iff this role's session completed its handshake.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.state.is_ready()
    }
}

/// Aggregate state published by the coordinator to external consumers.
///
/// Consumers observe this through the coordinator's `watch` channel; they
/// never mutate session state directly.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DualState {
    /// `true` between a successful `start_measurement` and the matching
    /// stop or terminal failure.
    pub measuring: bool,
    /// Left-shoe state.
    pub left: RoleState,
    /// Right-shoe state.
    pub right: RoleState,
    /// Set when the retry budget was exhausted; cleared on the next
    /// `start_measurement`.
    pub failure: Option<String>,
}

impl DualState {
    /// Borrow the state for one role.
    #[must_use]
    pub const fn role(&self, role: Role) -> &RoleState {
        match role {
            Role::Left => &self.left,
            Role::Right => &self.right,
        }
    }

    /// Mutably borrow the state for one role.
    pub fn role_mut(&mut self, role: Role) -> &mut RoleState {
        match role {
            Role::Left => &mut self.left,
            Role::Right => &mut self.right,
        }
    }

    /// `true` iff both roles are `Ready`.
    #[must_use]
    pub const fn both_connected(&self) -> bool {
        self.left.is_connected() && self.right.is_connected()
    }
}
