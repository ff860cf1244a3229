use bus_transport::BusError;
use device_model::DeviceError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = SyncError> = core::result::Result<T, E>;

/// Configuration problems caught before (or while refusing to let) a loop
/// thread start. None of these are transient: the robot description itself
/// is wrong.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown {kind} '{name}'")]
    Unknown { kind: &'static str, name: String },
    #[error("duplicate {kind} '{name}'")]
    Duplicate { kind: &'static str, name: String },
    #[error("group cycle through '{0}'")]
    GroupCycle(String),
    #[error("sync '{0}' covers no devices")]
    EmptyDevices(String),
    #[error("sync '{0}' covers no registers")]
    EmptyRegisters(String),
    #[error("sync '{sync}': devices '{first}' and '{other}' are on different buses")]
    MixedBuses {
        sync: String,
        first: String,
        other: String,
    },
    #[error("sync '{sync}': register '{register}' layout differs between devices")]
    MixedLayout { sync: String, register: String },
    #[error("sync '{sync}': register '{register}' is read-only")]
    NotWritable { sync: String, register: String },
    #[error("sync '{sync}': write span has a gap before address {address} on '{device}'")]
    NonContiguous {
        sync: String,
        device: String,
        address: u16,
    },
    #[error("loop '{0}': frequency must be positive")]
    BadFrequency(String),
    #[error("robot defines more than one joint manager")]
    DuplicateManager,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("loop '{0}' thread could not be spawned: {1}")]
    Spawn(String, String),
    #[error("loop '{0}' setup did not answer within {1:?}")]
    SetupTimeout(String, Duration),
    #[error("loop '{0}' thread exited before finishing setup")]
    SetupLost(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Bus(#[from] BusError),
}
