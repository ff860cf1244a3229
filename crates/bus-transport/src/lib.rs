//! bus-transport: register-oriented device bus abstractions
//!
//! This crate provides the traits and types for talking to devices that
//! expose a byte-addressable register file over some physical link (serial
//! servo buses, I2C, SPI). The default build enables a `mock` backend so
//! that the rest of the stack can run and be tested on any host without
//! hardware attached.

mod error;
pub use error::{BusError, Result};

mod traits;
pub use traits::Bus;

mod shared;
pub use shared::{BusGuard, SharedBus};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::MockBus;
