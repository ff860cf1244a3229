use crate::{Bus, BusError, Result};
use std::collections::{HashMap, HashSet};

/// An in-process mock bus backed by a byte map.
///
/// Reads return whatever was last written at (device, address), defaulting
/// to zero, so read-back flows behave like a device whose register file
/// powers up cleared. `set_online(false)` makes every transaction fail with
/// an I/O error, which is how tests exercise the transient-failure paths;
/// `set_silent` mutes a single device id instead, so only its transactions
/// time out while the rest of the bus keeps answering.
pub struct MockBus {
    memory: HashMap<(u8, u16), u8>,
    open: bool,
    online: bool,
    silent: HashSet<u8>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            memory: HashMap::new(),
            open: false,
            online: true,
            silent: HashSet::new(),
        }
    }

    /// Simulate the far end of the link going away.
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Simulate one device dropping off the bus while the link stays up.
    pub fn set_silent(&mut self, dev_id: u8, silent: bool) {
        if silent {
            self.silent.insert(dev_id);
        } else {
            self.silent.remove(&dev_id);
        }
    }

    /// Seed a register value directly, bypassing the open/online checks.
    /// Test setup helper.
    pub fn preload(&mut self, dev_id: u8, address: u16, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert((dev_id, address + i as u16), *b);
        }
    }

    fn check_usable(&self) -> Result<()> {
        if !self.open {
            return Err(BusError::Closed);
        }
        if !self.online {
            return Err(BusError::Io("mock bus is offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for MockBus {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, dev_id: u8, address: u16, len: usize) -> Result<Vec<u8>> {
        self.check_usable()?;
        if self.silent.contains(&dev_id) {
            return Err(BusError::NoResponse(dev_id));
        }
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            let byte = self
                .memory
                .get(&(dev_id, address + i as u16))
                .copied()
                .unwrap_or(0);
            out.push(byte);
        }
        Ok(out)
    }

    fn write(&mut self, dev_id: u8, address: u16, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        if self.silent.contains(&dev_id) {
            return Err(BusError::NoResponse(dev_id));
        }
        for (i, b) in data.iter().enumerate() {
            self.memory.insert((dev_id, address + i as u16), *b);
        }
        Ok(())
    }
}
