use bus_transport::BusError;
use thiserror::Error;

pub type Result<T, E = DeviceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device '{device}' has no register named '{register}'")]
    UnknownRegister { device: String, register: String },
    #[error("register '{0}' is read-only")]
    ReadOnly(String),
    #[error("device '{0}' is not open")]
    NotOpen(String),
    #[error("invalid register map: {0}")]
    BadModel(String),
    #[error("register '{register}' on '{device}' is already owned by sync loop {holder}")]
    SyncConflict {
        device: String,
        register: String,
        holder: u64,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
}
