use crate::error::{ConfigError, Result};
use crate::looper::LoopTask;
use bus_transport::{BusError, SharedBus};
use device_model::{Access, Device};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which sync loop flavor a robot config asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncClass {
    Read,
    Write,
    BulkRead,
    BulkWrite,
    MultiRead,
    MultiWrite,
}

impl SyncClass {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            SyncClass::Write | SyncClass::BulkWrite | SyncClass::MultiWrite
        )
    }
}

// loop id 0 means "free", so owned tokens start at 1
static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

fn next_loop_id() -> u64 {
    NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed)
}

/// The validated (devices x registers) matrix a sync loop runs over.
///
/// Construction performs every static check so nothing can fail once the
/// loop thread is up: nonempty coverage, a single shared bus, the register
/// present in every device, and write access for write syncs. Ownership of
/// each (device, register) pair is claimed against the group's loop id at
/// loop setup, with rollback so a conflict never leaves partial claims.
pub struct SyncGroup {
    name: String,
    devices: Vec<Arc<Device>>,
    registers: Vec<String>,
    bus: Arc<SharedBus>,
    loop_id: u64,
}

impl SyncGroup {
    pub fn new(
        name: impl Into<String>,
        devices: Vec<Arc<Device>>,
        registers: Vec<String>,
        for_write: bool,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if devices.is_empty() {
            return Err(ConfigError::EmptyDevices(name));
        }
        if registers.is_empty() {
            return Err(ConfigError::EmptyRegisters(name));
        }
        let bus = Arc::clone(devices[0].bus());
        for dev in &devices[1..] {
            if !Arc::ptr_eq(dev.bus(), &bus) {
                return Err(ConfigError::MixedBuses {
                    sync: name,
                    first: devices[0].name().to_string(),
                    other: dev.name().to_string(),
                });
            }
        }
        for dev in &devices {
            for reg_name in &registers {
                let reg = dev.register(reg_name)?;
                if for_write && reg.spec().access != Access::ReadWrite {
                    return Err(ConfigError::NotWritable {
                        sync: name,
                        register: reg_name.clone(),
                    });
                }
            }
        }
        Ok(Self {
            name,
            devices,
            registers,
            bus,
            loop_id: next_loop_id(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_id(&self) -> u64 {
        self.loop_id
    }

    /// Claim every covered pair, rolling back on the first conflict.
    fn claim_all(&self) -> Result<(), ConfigError> {
        let mut claimed: Vec<(&Arc<Device>, &String)> = Vec::new();
        for dev in &self.devices {
            for reg in &self.registers {
                if let Err(e) = dev.claim(reg, self.loop_id) {
                    for (d, r) in claimed {
                        d.release(r, self.loop_id);
                    }
                    return Err(e.into());
                }
                claimed.push((dev, reg));
            }
        }
        Ok(())
    }

    fn release_all(&self) {
        for dev in &self.devices {
            for reg in &self.registers {
                dev.release(reg, self.loop_id);
            }
        }
    }

    fn setup(&self) -> Result<()> {
        if !self.bus.is_open() {
            return Err(BusError::Closed.into());
        }
        self.claim_all()?;
        debug!(sync = %self.name, id = self.loop_id, "sync loop claimed its registers");
        Ok(())
    }

    /// Contiguous address span `[start, start + len)` covering the group's
    /// registers on `dev`. Gaps between registers are inside the span.
    fn span(&self, dev: &Device) -> Result<(u16, usize)> {
        let mut start = u16::MAX;
        let mut end: u32 = 0;
        for reg_name in &self.registers {
            let spec = dev.register(reg_name)?.spec();
            start = start.min(spec.address);
            end = end.max(spec.address as u32 + spec.size as u32);
        }
        Ok((start, (end - start as u32) as usize))
    }

    /// Registers of `dev` in ascending address order.
    fn ordered_specs<'a>(
        &'a self,
        dev: &'a Device,
    ) -> Result<Vec<(&'a str, &'a device_model::RegisterSpec)>, ConfigError> {
        let mut specs: Vec<(&str, &device_model::RegisterSpec)> = Vec::new();
        for reg_name in &self.registers {
            specs.push((reg_name.as_str(), dev.register(reg_name)?.spec()));
        }
        specs.sort_by_key(|(_, spec)| spec.address);
        Ok(specs)
    }

    /// A write span must be exactly tiled by its registers so padding bytes
    /// are never pushed to a device.
    fn check_contiguous(&self) -> Result<(), ConfigError> {
        for dev in &self.devices {
            let specs = self.ordered_specs(dev)?;
            let mut next = specs[0].1.address;
            for (_, spec) in &specs {
                if spec.address != next {
                    return Err(ConfigError::NonContiguous {
                        sync: self.name.clone(),
                        device: dev.name().to_string(),
                        address: spec.address,
                    });
                }
                next = spec.address + spec.size as u16;
            }
        }
        Ok(())
    }

    /// Multi syncs issue one bus call for all devices, so every device must
    /// present the same register layout.
    fn check_uniform_layout(&self) -> Result<(), ConfigError> {
        let first = &self.devices[0];
        for dev in &self.devices[1..] {
            for reg_name in &self.registers {
                let a = first.register(reg_name)?.spec();
                let b = dev.register(reg_name)?.spec();
                if a.address != b.address || a.size != b.size {
                    return Err(ConfigError::MixedLayout {
                        sync: self.name.clone(),
                        register: reg_name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncGroup")
            .field("name", &self.name)
            .field("devices", &self.devices.len())
            .field("registers", &self.registers)
            .field("loop_id", &self.loop_id)
            .finish()
    }
}

/// Refreshes each register of each device with one bus read per pair,
/// under a single bus acquisition per tick.
pub struct ReadSync {
    group: SyncGroup,
}

impl ReadSync {
    pub fn new(group: SyncGroup) -> Self {
        Self { group }
    }
}

impl LoopTask for ReadSync {
    fn setup(&mut self) -> Result<()> {
        self.group.setup()
    }

    fn tick(&mut self) -> Result<()> {
        let g = &self.group;
        let mut bus = g.bus.acquire().ok_or(BusError::Busy)?;
        'devices: for dev in &g.devices {
            for reg_name in &g.registers {
                let spec = dev.register(reg_name)?.spec();
                match bus.read(dev.dev_id(), spec.address, spec.size) {
                    Ok(bytes) => dev.set_raw_value(reg_name, spec.order.decode(&bytes))?,
                    Err(e) => {
                        warn!(sync = %g.name, device = %dev.name(), "read failed: {e}");
                        continue 'devices;
                    }
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.group.release_all();
    }
}

/// Flushes each register's cached value to each device, one bus write per
/// pair under a single acquisition per tick.
pub struct WriteSync {
    group: SyncGroup,
}

impl WriteSync {
    pub fn new(group: SyncGroup) -> Self {
        Self { group }
    }
}

impl LoopTask for WriteSync {
    fn setup(&mut self) -> Result<()> {
        self.group.setup()
    }

    fn tick(&mut self) -> Result<()> {
        let g = &self.group;
        let mut bus = g.bus.acquire().ok_or(BusError::Busy)?;
        'devices: for dev in &g.devices {
            for reg_name in &g.registers {
                let spec = dev.register(reg_name)?.spec();
                let bytes = spec.order.encode(dev.raw_value(reg_name)?, spec.size);
                if let Err(e) = bus.write(dev.dev_id(), spec.address, &bytes) {
                    warn!(sync = %g.name, device = %dev.name(), "write failed: {e}");
                    continue 'devices;
                }
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.group.release_all();
    }
}

/// One read transaction per device covering the whole register span.
/// Address gaps are transferred and discarded: bandwidth traded for fewer
/// transactions.
pub struct BulkReadSync {
    group: SyncGroup,
}

impl BulkReadSync {
    pub fn new(group: SyncGroup) -> Self {
        Self { group }
    }
}

impl LoopTask for BulkReadSync {
    fn setup(&mut self) -> Result<()> {
        self.group.setup()
    }

    fn tick(&mut self) -> Result<()> {
        let g = &self.group;
        let mut bus = g.bus.acquire().ok_or(BusError::Busy)?;
        for dev in &g.devices {
            let (start, len) = g.span(dev)?;
            let bytes = match bus.read(dev.dev_id(), start, len) {
                Ok(b) => b,
                Err(e) => {
                    warn!(sync = %g.name, device = %dev.name(), "bulk read failed: {e}");
                    continue;
                }
            };
            for reg_name in &g.registers {
                let spec = dev.register(reg_name)?.spec();
                let off = (spec.address - start) as usize;
                dev.set_raw_value(reg_name, spec.order.decode(&bytes[off..off + spec.size]))?;
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.group.release_all();
    }
}

/// One write transaction per device covering the whole register span. The
/// span must be exactly tiled by the registers (checked at construction):
/// a gap would mean writing bytes the config never mentioned.
pub struct BulkWriteSync {
    group: SyncGroup,
}

impl BulkWriteSync {
    pub fn new(group: SyncGroup) -> Result<Self, ConfigError> {
        group.check_contiguous()?;
        Ok(Self { group })
    }
}

impl std::fmt::Debug for BulkWriteSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkWriteSync")
            .field("group", &self.group)
            .finish()
    }
}

impl LoopTask for BulkWriteSync {
    fn setup(&mut self) -> Result<()> {
        self.group.setup()
    }

    fn tick(&mut self) -> Result<()> {
        let g = &self.group;
        let mut bus = g.bus.acquire().ok_or(BusError::Busy)?;
        for dev in &g.devices {
            let (start, len) = g.span(dev)?;
            let mut buf = vec![0u8; len];
            for reg_name in &g.registers {
                let spec = dev.register(reg_name)?.spec();
                let off = (spec.address - start) as usize;
                buf[off..off + spec.size]
                    .copy_from_slice(&spec.order.encode(dev.raw_value(reg_name)?, spec.size));
            }
            if let Err(e) = bus.write(dev.dev_id(), start, &buf) {
                warn!(sync = %g.name, device = %dev.name(), "bulk write failed: {e}");
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.group.release_all();
    }
}

/// One `sync_read` bus call per tick covering every device id at once.
/// Requires a uniform register layout across devices.
pub struct MultiReadSync {
    group: SyncGroup,
}

impl MultiReadSync {
    pub fn new(group: SyncGroup) -> Result<Self, ConfigError> {
        group.check_uniform_layout()?;
        Ok(Self { group })
    }
}

impl LoopTask for MultiReadSync {
    fn setup(&mut self) -> Result<()> {
        self.group.setup()
    }

    fn tick(&mut self) -> Result<()> {
        let g = &self.group;
        let (start, len) = g.span(&g.devices[0])?;
        let ids: Vec<u8> = g.devices.iter().map(|d| d.dev_id()).collect();
        let replies = {
            let mut bus = g.bus.acquire().ok_or(BusError::Busy)?;
            bus.sync_read(&ids, start, len)?
        };
        for dev in &g.devices {
            let Some(bytes) = replies.get(&dev.dev_id()) else {
                warn!(sync = %g.name, device = %dev.name(), "no reply in sync read");
                continue;
            };
            for reg_name in &g.registers {
                let spec = dev.register(reg_name)?.spec();
                let off = (spec.address - start) as usize;
                dev.set_raw_value(reg_name, spec.order.decode(&bytes[off..off + spec.size]))?;
            }
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.group.release_all();
    }
}

/// One `sync_write` bus call per tick covering every device id at once.
/// Requires uniform layout and an exactly tiled span, like
/// [`BulkWriteSync`].
pub struct MultiWriteSync {
    group: SyncGroup,
}

impl MultiWriteSync {
    pub fn new(group: SyncGroup) -> Result<Self, ConfigError> {
        group.check_uniform_layout()?;
        group.check_contiguous()?;
        Ok(Self { group })
    }
}

impl LoopTask for MultiWriteSync {
    fn setup(&mut self) -> Result<()> {
        self.group.setup()
    }

    fn tick(&mut self) -> Result<()> {
        let g = &self.group;
        let (start, len) = g.span(&g.devices[0])?;
        let mut writes: HashMap<u8, Vec<u8>> = HashMap::with_capacity(g.devices.len());
        for dev in &g.devices {
            let mut buf = vec![0u8; len];
            for reg_name in &g.registers {
                let spec = dev.register(reg_name)?.spec();
                let off = (spec.address - start) as usize;
                buf[off..off + spec.size]
                    .copy_from_slice(&spec.order.encode(dev.raw_value(reg_name)?, spec.size));
            }
            writes.insert(dev.dev_id(), buf);
        }
        let mut bus = g.bus.acquire().ok_or(BusError::Busy)?;
        bus.sync_write(&writes, start, len)?;
        Ok(())
    }

    fn teardown(&mut self) {
        self.group.release_all();
    }
}
