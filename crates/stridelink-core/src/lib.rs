//! # stridelink-core
//!
//! Session management for a pair of BLE smart-shoe peripherals.
//!
//! This crate provides:
//! - Dual-role scanning with a bounded retry budget
//! - Per-connection GATT handshake state machines (connect, MTU,
//!   discovery, subscribe, start command)
//! - Framed-JSON notification decoding with additive state merging
//! - A periodic command pump for firmware that must be polled
//! - Configuration management for device identities and policy
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`coordinator`] - Dual-session orchestration, retry budget, published state
//! - [`session`] - One peripheral connection's handshake state machine
//! - [`transport`] - Platform seam the sessions are written against
//! - [`bluetooth`] - btleplug-backed transport (behind the `bluetooth` feature)
//! - [`fake`] - Scripted in-memory transport for tests and simulation
//! - [`decode`] - Framed-JSON notification payload decoding
//! - [`config`] - Device identities, retry policy, scan mode
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Roles, connection states, frames, published state

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod error;
pub mod fake;
mod pump;
pub mod session;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::BtleplugTransport;
pub use config::{CoordinatorConfig, DeviceIdentity, ScanMode, CCCD_UUID};
pub use coordinator::Coordinator;
pub use error::{
    ConfigError, CoordinatorError, DecodeError, Result, SessionError, StrideError, TransportError,
};
pub use fake::{FakePeripheral, FakeTransport, WriteRecord};
pub use session::{
    PeripheralSession, SessionNotice, MEASURE_COMMAND, RESET_COMMAND, START_COMMAND, STOP_COMMAND,
};
pub use transport::{
    Advertisement, BleTransport, GattProfile, GattService, LinkEvent, LinkEventSink,
    LinkEventStream, PeripheralLink,
};
pub use types::{ConnectionState, DualState, Role, RoleState, SensorFrame, FSR_PAD_COUNT};
