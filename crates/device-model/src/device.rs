use crate::error::{DeviceError, Result};
use crate::register::Register;
use crate::types::{Access, DeviceModel};
use crate::value::{Conversion, Value};
use bus_transport::{BusError, SharedBus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// A proxy for one physical device on a bus.
///
/// A device owns its registers in an arena (`Vec` plus a name index); clone
/// registers hold the arena index of their base instead of a back-pointer.
/// The device is shared between sync loop threads and direct callers as an
/// `Arc<Device>`; per-register state is atomic, so no device-wide lock is
/// needed.
pub struct Device {
    name: String,
    dev_id: u8,
    bus: Arc<SharedBus>,
    registers: Vec<Register>,
    index: HashMap<String, usize>,
    open: AtomicBool,
}

impl Device {
    /// Build a device from its model's register map.
    ///
    /// Fails fast on a malformed map: zero or oversized register widths,
    /// clones of unknown registers, or clones whose address or size differ
    /// from their base.
    pub fn new(
        name: impl Into<String>,
        dev_id: u8,
        bus: Arc<SharedBus>,
        model: &DeviceModel,
    ) -> Result<Self> {
        let name = name.into();

        // Deterministic arena order: base registers by address, then clone
        // views, so a clone's base always has a lower index.
        let mut base_names: Vec<&String> = model
            .registers
            .iter()
            .filter(|(_, spec)| spec.clone_of.is_none())
            .map(|(n, _)| n)
            .collect();
        base_names.sort_by_key(|n| (model.registers[*n].address, (*n).clone()));
        let mut clone_names: Vec<&String> = model
            .registers
            .iter()
            .filter(|(_, spec)| spec.clone_of.is_some())
            .map(|(n, _)| n)
            .collect();
        clone_names.sort();

        let mut registers = Vec::with_capacity(model.registers.len());
        let mut index = HashMap::with_capacity(model.registers.len());

        for reg_name in base_names.into_iter().chain(clone_names) {
            let spec = model.registers[reg_name].clone();
            if spec.size == 0 || spec.size > 4 {
                return Err(DeviceError::BadModel(format!(
                    "register '{reg_name}' has unsupported size {}",
                    spec.size
                )));
            }
            if spec.minim > spec.effective_maxim() {
                return Err(DeviceError::BadModel(format!(
                    "register '{reg_name}' has minim {} above maxim {}",
                    spec.minim,
                    spec.effective_maxim()
                )));
            }
            if let Conversion::Linear {
                sign_bit: Some(bit),
                ..
            } = &spec.conversion
            {
                if u32::from(*bit) >= 32 || usize::from(*bit) > 8 * spec.size {
                    return Err(DeviceError::BadModel(format!(
                        "register '{reg_name}' sign bit {bit} exceeds its {}-byte width",
                        spec.size
                    )));
                }
            }
            let base = match &spec.clone_of {
                None => None,
                Some(base_name) => {
                    let base_idx =
                        *index
                            .get(base_name.as_str())
                            .ok_or_else(|| {
                                DeviceError::BadModel(format!(
                                    "register '{reg_name}' clones unknown register '{base_name}'"
                                ))
                            })?;
                    let base_reg: &Register = &registers[base_idx];
                    if base_reg.spec().address != spec.address
                        || base_reg.spec().size != spec.size
                    {
                        return Err(DeviceError::BadModel(format!(
                            "clone '{reg_name}' does not match '{base_name}' address/size"
                        )));
                    }
                    Some(base_idx)
                }
            };
            index.insert(reg_name.clone(), registers.len());
            registers.push(Register::new(reg_name.clone(), spec, base));
        }

        Ok(Self {
            name,
            dev_id,
            bus,
            registers,
            index,
            open: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dev_id(&self) -> u8 {
        self.dev_id
    }

    pub fn bus(&self) -> &Arc<SharedBus> {
        &self.bus
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Register names in arena order (bases before clones).
    pub fn register_names(&self) -> impl Iterator<Item = &str> {
        self.registers.iter().map(|r| r.name())
    }

    pub fn has_register(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn register(&self, name: &str) -> Result<&Register> {
        let idx = self.index_of(name)?;
        Ok(&self.registers[idx])
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| DeviceError::UnknownRegister {
                device: self.name.clone(),
                register: name.to_string(),
            })
    }

    /// The register holding cache and ownership for `reg`: itself, or its
    /// base when `reg` is a clone view.
    fn cell<'a>(&'a self, reg: &'a Register) -> &'a Register {
        match reg.base_index() {
            Some(base) => &self.registers[base],
            None => reg,
        }
    }

    /// Open the device: requires the bus link to be open, then seeds every
    /// base register's cache with one read pass so values start from the
    /// device's truth rather than the declared defaults.
    pub fn open(&self) -> Result<()> {
        let mut bus = self.bus.acquire().ok_or(BusError::Busy)?;
        if !bus.is_open() {
            return Err(DeviceError::Bus(BusError::Closed));
        }
        for reg in self.registers.iter().filter(|r| r.base_index().is_none()) {
            let spec = reg.spec();
            let bytes = bus.read(self.dev_id, spec.address, spec.size)?;
            reg.store_cache(spec.order.decode(&bytes));
        }
        drop(bus);
        self.open.store(true, Ordering::Release);
        debug!(device = %self.name, "device opened");
        Ok(())
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        debug!(device = %self.name, "device closed");
    }

    /// Read a register's external value.
    ///
    /// When the register is sync-owned the cached value is returned
    /// immediately with no bus traffic; otherwise the cache is refreshed
    /// from the bus first and a failed refresh is surfaced (the stale cache
    /// is kept).
    pub fn read(&self, reg_name: &str) -> Result<Value> {
        let reg = self.register(reg_name)?;
        let cell = self.cell(reg);
        if !cell.is_sync_owned() {
            self.refresh(cell)?;
        }
        Ok(reg.spec().conversion.to_external(cell.load_cache()))
    }

    /// Write a register's external value.
    ///
    /// The value is converted to internal format and clipped to the
    /// register's bounds (saturation, by policy, is not an error). When the
    /// register is sync-owned the result only lands in the cache for the
    /// owning write loop to flush; otherwise it is written through to the
    /// bus.
    pub fn write(&self, reg_name: &str, value: Value) -> Result<()> {
        let reg = self.register(reg_name)?;
        if reg.spec().access != Access::ReadWrite {
            return Err(DeviceError::ReadOnly(reg_name.to_string()));
        }
        let cell = self.cell(reg);
        let current = cell.load_cache();
        let internal = match reg.spec().conversion.to_internal(&value, current) {
            Some(v) => reg.clip(v),
            None => {
                warn!(
                    device = %self.name, register = reg_name,
                    "value {value:?} not representable; keeping current"
                );
                current
            }
        };
        cell.store_cache(internal);
        if !cell.is_sync_owned() {
            self.write_through(cell, internal)?;
        }
        Ok(())
    }

    /// Cached internal value of a register (clone-aware). No bus traffic.
    pub fn raw_value(&self, reg_name: &str) -> Result<u32> {
        let reg = self.register(reg_name)?;
        Ok(self.cell(reg).load_cache())
    }

    /// Store an internal value into a register's cache (clone-aware).
    /// Used by read sync loops to publish values they fetched in bulk.
    pub fn set_raw_value(&self, reg_name: &str, value: u32) -> Result<()> {
        let reg = self.register(reg_name)?;
        self.cell(reg).store_cache(value);
        Ok(())
    }

    /// Claim a register for the sync loop `loop_id`. Claiming an already
    /// owned register is a hard error: two loops must never own the same
    /// (device, register) pair.
    pub fn claim(&self, reg_name: &str, loop_id: u64) -> Result<()> {
        let reg = self.register(reg_name)?;
        self.cell(reg).claim(loop_id).map_err(|holder| {
            DeviceError::SyncConflict {
                device: self.name.clone(),
                register: reg_name.to_string(),
                holder,
            }
        })
    }

    /// Release a register claimed by `loop_id`. Releasing something not
    /// held by that loop is a no-op.
    pub fn release(&self, reg_name: &str, loop_id: u64) {
        if let Ok(reg) = self.register(reg_name) {
            self.cell(reg).release(loop_id);
        }
    }

    fn refresh(&self, cell: &Register) -> Result<()> {
        if !self.is_open() {
            return Err(DeviceError::NotOpen(self.name.clone()));
        }
        let mut bus = self.bus.acquire().ok_or(BusError::Busy)?;
        let spec = cell.spec();
        let bytes = bus.read(self.dev_id, spec.address, spec.size)?;
        cell.store_cache(spec.order.decode(&bytes));
        Ok(())
    }

    fn write_through(&self, cell: &Register, internal: u32) -> Result<()> {
        if !self.is_open() {
            return Err(DeviceError::NotOpen(self.name.clone()));
        }
        let mut bus = self.bus.acquire().ok_or(BusError::Busy)?;
        let spec = cell.spec();
        let bytes = spec.order.encode(internal, spec.size);
        bus.write(self.dev_id, spec.address, &bytes)?;
        Ok(())
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("dev_id", &self.dev_id)
            .field("bus", &self.bus.name())
            .field("registers", &self.registers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RegisterSpec;
    use crate::value::{BoolMode, ByteOrder, Conversion};
    use bus_transport::MockBus;
    use std::time::Duration;

    fn test_model() -> DeviceModel {
        let mut registers = HashMap::new();
        registers.insert(
            "goal_position".to_string(),
            RegisterSpec {
                address: 30,
                size: 2,
                access: Access::ReadWrite,
                order: ByteOrder::LittleEndian,
                default: 512,
                minim: 0,
                maxim: Some(1023),
                conversion: Conversion::Identity,
                clone_of: None,
            },
        );
        registers.insert(
            "present_position".to_string(),
            RegisterSpec {
                address: 36,
                size: 2,
                access: Access::ReadOnly,
                order: ByteOrder::LittleEndian,
                default: 0,
                minim: 0,
                maxim: Some(1023),
                conversion: Conversion::Identity,
                clone_of: None,
            },
        );
        registers.insert(
            "goal_position_deg".to_string(),
            RegisterSpec {
                address: 30,
                size: 2,
                access: Access::ReadWrite,
                order: ByteOrder::LittleEndian,
                default: 512,
                minim: 0,
                maxim: Some(1023),
                conversion: Conversion::Linear {
                    factor: 3.41,
                    offset: 512.0,
                    sign_bit: None,
                },
                clone_of: Some("goal_position".to_string()),
            },
        );
        registers.insert(
            "led".to_string(),
            RegisterSpec {
                address: 25,
                size: 1,
                access: Access::ReadWrite,
                order: ByteOrder::LittleEndian,
                default: 0,
                minim: 0,
                maxim: None,
                conversion: Conversion::Bool {
                    bits: None,
                    mode: BoolMode::Any,
                    mask: None,
                },
                clone_of: None,
            },
        );
        DeviceModel { registers }
    }

    fn open_device() -> Arc<Device> {
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        bus.open().unwrap();
        let dev = Device::new("servo1", 1, bus, &test_model()).unwrap();
        dev.open().unwrap();
        Arc::new(dev)
    }

    #[test]
    fn test_unknown_register_is_error() {
        let dev = open_device();
        assert!(matches!(
            dev.read("no_such_register"),
            Err(DeviceError::UnknownRegister { .. })
        ));
    }

    #[test]
    fn test_write_clips_to_bounds_then_reads_back() {
        let dev = open_device();
        dev.write("goal_position", Value::F64(1500.0)).unwrap();
        // clipped to 1023, not wrapped, not an error
        assert_eq!(dev.read("goal_position").unwrap(), Value::F64(1023.0));
        assert_eq!(dev.raw_value("goal_position").unwrap(), 1023);
    }

    #[test]
    fn test_read_only_register_rejects_write() {
        let dev = open_device();
        assert!(matches!(
            dev.write("present_position", Value::F64(1.0)),
            Err(DeviceError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_clone_shares_cache_with_base() {
        let dev = open_device();
        dev.write("goal_position", Value::F64(512.0)).unwrap();
        // the degree view decodes the same internal value
        assert_eq!(dev.read("goal_position_deg").unwrap(), Value::F64(0.0));
        dev.write("goal_position_deg", Value::F64(10.0)).unwrap();
        let raw = dev.raw_value("goal_position").unwrap();
        assert_eq!(raw, (10.0f64 * 3.41 + 512.0).round() as u32);
    }

    #[test]
    fn test_sync_owned_register_reads_cache_only() {
        let dev = open_device();
        dev.claim("present_position", 42).unwrap();
        dev.set_raw_value("present_position", 700).unwrap();
        // the mock bus has 0 at this address; a bus-backed read would
        // overwrite the cache, a cache read must not
        assert_eq!(dev.read("present_position").unwrap(), Value::F64(700.0));
        dev.release("present_position", 42);
        assert_eq!(dev.read("present_position").unwrap(), Value::F64(0.0));
    }

    #[test]
    fn test_overlapping_claims_rejected() {
        let dev = open_device();
        dev.claim("goal_position", 1).unwrap();
        assert!(matches!(
            dev.claim("goal_position", 2),
            Err(DeviceError::SyncConflict { holder: 1, .. })
        ));
        // clone and base share ownership
        assert!(matches!(
            dev.claim("goal_position_deg", 2),
            Err(DeviceError::SyncConflict { .. })
        ));
    }

    #[test]
    fn test_closed_device_fails_connectivity() {
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        let dev = Device::new("servo1", 1, bus, &test_model()).unwrap();
        // never opened
        assert!(matches!(
            dev.read("goal_position"),
            Err(DeviceError::NotOpen(_))
        ));
        assert!(matches!(
            dev.write("goal_position", Value::F64(1.0)),
            Err(DeviceError::NotOpen(_))
        ));
    }

    #[test]
    fn test_clone_of_unknown_register_rejected() {
        let mut model = test_model();
        model
            .registers
            .get_mut("goal_position_deg")
            .map(|s| s.clone_of = Some("missing".to_string()));
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        assert!(matches!(
            Device::new("servo1", 1, bus, &model),
            Err(DeviceError::BadModel(_))
        ));
    }

    #[test]
    fn test_oversized_sign_bit_rejected() {
        let mut model = test_model();
        model.registers.get_mut("goal_position_deg").map(|s| {
            s.conversion = Conversion::Linear {
                factor: 1.0,
                offset: 0.0,
                sign_bit: Some(40),
            }
        });
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        assert!(matches!(
            Device::new("servo1", 1, bus, &model),
            Err(DeviceError::BadModel(_))
        ));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut model = test_model();
        model.registers.get_mut("goal_position").map(|s| {
            s.minim = 100;
            s.maxim = Some(50);
        });
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        assert!(matches!(
            Device::new("servo1", 1, bus, &model),
            Err(DeviceError::BadModel(_))
        ));
    }

    #[test]
    fn test_below_minimum_write_saturates_at_minimum() {
        let mut model = test_model();
        model
            .registers
            .get_mut("goal_position")
            .map(|s| s.minim = 10);
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(MockBus::new()),
            Duration::from_millis(50),
        ));
        bus.open().unwrap();
        let dev = Device::new("servo1", 1, bus, &model).unwrap();
        dev.open().unwrap();
        dev.write("goal_position", Value::F64(500.0)).unwrap();
        dev.write("goal_position", Value::F64(-5.0)).unwrap();
        // saturated at the minimum, not kept at the previous value
        assert_eq!(dev.raw_value("goal_position").unwrap(), 10);
    }

    #[test]
    fn test_open_seeds_caches_from_bus() {
        let mut mock = MockBus::new();
        mock.preload(1, 36, &[0xFF, 0x02]); // 767
        let bus = Arc::new(SharedBus::new(
            "mock0",
            Box::new(mock),
            Duration::from_millis(50),
        ));
        bus.open().unwrap();
        let dev = Device::new("servo1", 1, bus, &test_model()).unwrap();
        dev.open().unwrap();
        assert_eq!(dev.raw_value("present_position").unwrap(), 767);
    }
}
