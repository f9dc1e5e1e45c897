use std::{
    cell::Cell,
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use log::info;

pub const LOCK_MASK: u64 = 0b11;
pub const UNLOCKED_VALUE: u64 = 0b01;
pub const MONITOR_VALUE: u64 = 0b10;

pub const HASH_SHIFT: u32 = 8;
pub const HASH_BITS: u32 = 31;
pub const HASH_MASK: u64 = (1 << HASH_BITS) - 1;
const HASH_MASK_IN_PLACE: u64 = HASH_MASK << HASH_SHIFT;

/// Replaces a generated hash of zero, which means "no hash yet".
const ZERO_HASH_REPLACEMENT: u32 = 0xBAD;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockState {
    Unlocked,
    /// The object has a heavyweight monitor.
    Inflated,
}

/// Mark word of a monitored object: lock state bits and the identity hash.
pub struct ObjectHeader {
    mark: AtomicU64,
}

impl ObjectHeader {
    pub const fn new() -> Self {
        Self {
            mark: AtomicU64::new(UNLOCKED_VALUE),
        }
    }

    pub fn mark(&self) -> u64 {
        self.mark.load(Ordering::Acquire)
    }

    pub fn lock_state(&self) -> LockState {
        match self.mark() & LOCK_MASK {
            MONITOR_VALUE => LockState::Inflated,
            _ => LockState::Unlocked,
        }
    }

    pub fn is_inflated(&self) -> bool {
        self.lock_state() == LockState::Inflated
    }

    fn set_lock_bits(&self, bits: u64) -> u64 {
        let mut current = self.mark();
        loop {
            let new = (current & !LOCK_MASK) | bits;
            match self
                .mark
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(previous) => return previous,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns true if the object was not inflated before.
    pub fn set_inflated(&self) -> bool {
        self.set_lock_bits(MONITOR_VALUE) & LOCK_MASK != MONITOR_VALUE
    }

    /// Reverts the header to unlocked, keeping the hash.
    pub fn clear_inflated(&self) {
        let current = self.mark();
        let new = (current & !LOCK_MASK) | UNLOCKED_VALUE;
        if self
            .mark
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("lost the race restoring header {:#x}, retrying", current);
            self.set_lock_bits(UNLOCKED_VALUE);
        }
    }

    /// The identity hash, if one was assigned.
    pub fn hash(&self) -> Option<u32> {
        hash_of(self.mark())
    }

    /// The identity hash, assigning one on first use.
    pub fn identity_hash(&self) -> u32 {
        let mut current = self.mark();
        loop {
            if let Some(hash) = hash_of(current) {
                return hash;
            }

            let hash = next_hash();
            let new = current | ((hash as u64) << HASH_SHIFT);
            match self
                .mark
                .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return hash,
                Err(actual) => current = actual,
            }
        }
    }
}

fn hash_of(mark: u64) -> Option<u32> {
    match (mark & HASH_MASK_IN_PLACE) >> HASH_SHIFT {
        0 => None,
        hash => Some(hash as u32),
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("lock_state", &self.lock_state())
            .field("hash", &self.hash())
            .finish()
    }
}

static SEED: AtomicU32 = AtomicU32::new(0x9E37_79B9);

thread_local! {
    // Marsaglia's xor-shift with per-thread state.
    static HASH_STATE: Cell<[u32; 4]> = Cell::new([
        SEED.fetch_add(0x9E37_79B9, Ordering::Relaxed),
        842_502_087,
        0x8767,
        273_326_509,
    ]);
}

fn next_hash() -> u32 {
    HASH_STATE.with(|state| {
        let [x, y, z, w] = state.get();
        let t = x ^ (x << 11);
        let v = (w ^ (w >> 19)) ^ (t ^ (t >> 8));
        state.set([y, z, w, v]);

        match v & HASH_MASK as u32 {
            0 => ZERO_HASH_REPLACEMENT,
            hash => hash,
        }
    })
}
