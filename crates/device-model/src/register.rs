use crate::types::RegisterSpec;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Sync-ownership token value meaning "free": the register is bus-backed
/// and direct access goes to the wire.
pub const FREE: u64 = 0;

/// Runtime state of one register: its declarative spec plus the cached
/// internal value and the sync-ownership token.
///
/// The cached value is the last internal (wire) integer seen for this
/// register; it fits in a `u32` because register sizes are capped at four
/// bytes. The owner token is `FREE` when no sync loop has claimed the
/// register, or the nonzero id of the loop that did. Both are atomics so a
/// sync loop thread and direct-access callers can touch them without a
/// lock; single-writer discipline is established by the claim protocol, not
/// by locking.
pub struct Register {
    name: String,
    spec: RegisterSpec,
    maxim: u32,
    /// Arena index of the base register when this is a clone view. Cache
    /// and ownership live on the base; the clone only adds a conversion.
    base: Option<usize>,
    cached: AtomicU32,
    owner: AtomicU64,
}

impl Register {
    pub fn new(name: impl Into<String>, spec: RegisterSpec, base: Option<usize>) -> Self {
        let maxim = spec.effective_maxim();
        let default = spec.default;
        Self {
            name: name.into(),
            spec,
            maxim,
            base,
            cached: AtomicU32::new(default),
            owner: AtomicU64::new(FREE),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &RegisterSpec {
        &self.spec
    }

    pub fn minim(&self) -> u32 {
        self.spec.minim
    }

    pub fn maxim(&self) -> u32 {
        self.maxim
    }

    pub(crate) fn base_index(&self) -> Option<usize> {
        self.base
    }

    /// Cached internal value. For clones callers must go through the
    /// device so the base register's cache is used.
    pub(crate) fn load_cache(&self) -> u32 {
        self.cached.load(Ordering::Acquire)
    }

    pub(crate) fn store_cache(&self, value: u32) {
        self.cached.store(value, Ordering::Release);
    }

    /// Clip an internal value to this register's bounds. Saturation is the
    /// documented policy for out-of-range writes; values are never wrapped
    /// and never rejected. Min-then-max, so even a degenerate bounds pair
    /// yields a value instead of panicking.
    pub fn clip(&self, value: u32) -> u32 {
        value.min(self.maxim).max(self.spec.minim)
    }

    /// Current sync owner, `FREE` when bus-backed.
    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub fn is_sync_owned(&self) -> bool {
        self.owner() != FREE
    }

    /// Claim this register for a sync loop. Fails when another loop
    /// already holds it, returning the holder's id.
    pub(crate) fn claim(&self, loop_id: u64) -> Result<(), u64> {
        match self
            .owner
            .compare_exchange(FREE, loop_id, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(holder) if holder == loop_id => Ok(()),
            Err(holder) => Err(holder),
        }
    }

    /// Release a claim. A no-op when `loop_id` is not the current holder.
    pub(crate) fn release(&self, loop_id: u64) {
        let _ = self
            .owner
            .compare_exchange(loop_id, FREE, Ordering::AcqRel, Ordering::Acquire);
    }
}
