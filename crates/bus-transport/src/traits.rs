use crate::{BusError, Result};
use std::collections::HashMap;

/// A minimal blocking interface to a register-oriented device bus.
///
/// Implementations wrap one physical link carrying one or more addressable
/// devices, each exposing a flat byte-addressed register file. The trait is
/// object safe so that devices can hold a `dyn Bus` without knowing the
/// backend.
pub trait Bus: Send {
    /// Open the physical link. Reads and writes fail until this succeeds.
    fn open(&mut self) -> Result<()>;

    /// Close the physical link. Idempotent.
    fn close(&mut self) -> Result<()>;

    /// Whether the link is currently open.
    fn is_open(&self) -> bool;

    /// Read `len` bytes starting at `address` from device `dev_id`.
    fn read(&mut self, dev_id: u8, address: u16, len: usize) -> Result<Vec<u8>>;

    /// Write `data` starting at `address` on device `dev_id`.
    fn write(&mut self, dev_id: u8, address: u16, data: &[u8]) -> Result<()>;

    /// Read the same register span from several devices in one transaction.
    ///
    /// Backends with a broadcast read primitive should override this; the
    /// default is a per-device loop and reports partial results only when
    /// every device answered.
    fn sync_read(
        &mut self,
        dev_ids: &[u8],
        address: u16,
        len: usize,
    ) -> Result<HashMap<u8, Vec<u8>>> {
        let mut out = HashMap::with_capacity(dev_ids.len());
        for &id in dev_ids {
            let data = self.read(id, address, len)?;
            out.insert(id, data);
        }
        Ok(out)
    }

    /// Write per-device payloads to the same register span in one
    /// transaction. All payloads must be exactly `len` bytes.
    fn sync_write(&mut self, writes: &HashMap<u8, Vec<u8>>, address: u16, len: usize) -> Result<()> {
        for (&id, data) in writes {
            if data.len() != len {
                return Err(BusError::InvalidAccess("sync_write payload length mismatch"));
            }
            self.write(id, address, data)?;
        }
        Ok(())
    }
}
