use thiserror::Error;

pub type Result<T, E = BusError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is not open")]
    Closed,
    #[error("bus is busy (could not be acquired within the timeout)")]
    Busy,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("invalid access: {0}")]
    InvalidAccess(&'static str),
    #[error("device {0} did not respond")]
    NoResponse(u8),
}
