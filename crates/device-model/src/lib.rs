//! device-model: register maps, value conversion, and bus-backed devices

mod device;
mod error;
mod loader;
mod register;
mod types;
mod value;

pub use device::Device;
pub use error::{DeviceError, Result};
pub use loader::{load_model_file, load_models_dir, ModelRegistry};
pub use register::{Register, FREE};
pub use types::{Access, DeviceModel, RegisterSpec};
pub use value::{BoolMode, ByteOrder, Conversion, MapPair, Value};
