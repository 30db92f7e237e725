//! Thread-index registry.
//!
//! Hands out small integer indices into the cache matrix. Index 0 is
//! reserved for the main thread; the others are assigned round-robin from a
//! flag table under one mutex.

use parking_lot::Mutex;

use mcmalloc_core::MallocError;
use mcmalloc_core::config::MAX_THREAD_CAPACITY;

pub const MAIN_THREAD_INDEX: usize = 0;

struct Slots {
    claimed: [bool; MAX_THREAD_CAPACITY],
    capacity: usize,
    cursor: usize,
}

pub struct ThreadRegistry {
    slots: Mutex<Slots>,
}

impl ThreadRegistry {
    /// A registry with `capacity` slots (clamped to `2..=MAX_THREAD_CAPACITY`).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                claimed: [false; MAX_THREAD_CAPACITY],
                capacity: capacity.clamp(2, MAX_THREAD_CAPACITY),
                cursor: MAIN_THREAD_INDEX,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity
    }

    pub fn claim_main(&self) -> Result<usize, MallocError> {
        let mut slots = self.slots.lock();
        if slots.claimed[MAIN_THREAD_INDEX] {
            return Err(MallocError::MainSlotClaimed);
        }
        slots.claimed[MAIN_THREAD_INDEX] = true;
        Ok(MAIN_THREAD_INDEX)
    }

    /// Claim the next free worker index after the last one handed out.
    pub fn claim(&self) -> Result<usize, MallocError> {
        let mut slots = self.slots.lock();
        let workers = slots.capacity - 1;
        for step in 1..=workers {
            let index = 1 + (slots.cursor + step - 1) % workers;
            if !slots.claimed[index] {
                slots.claimed[index] = true;
                slots.cursor = index;
                return Ok(index);
            }
        }
        Err(MallocError::ThreadSlotsExhausted {
            capacity: slots.capacity,
        })
    }

    pub fn release(&self, index: usize) {
        let mut slots = self.slots.lock();
        if index < slots.capacity {
            slots.claimed[index] = false;
        }
    }

    /// Indices currently claimed, main included.
    pub fn active(&self) -> usize {
        let slots = self.slots.lock();
        slots.claimed[..slots.capacity].iter().filter(|&&c| c).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_slot_is_reserved() {
        let reg = ThreadRegistry::new(4);
        assert_eq!(reg.claim_main(), Ok(MAIN_THREAD_INDEX));
        assert_eq!(reg.claim_main(), Err(MallocError::MainSlotClaimed));
        reg.release(MAIN_THREAD_INDEX);
        assert_eq!(reg.claim_main(), Ok(MAIN_THREAD_INDEX));
    }

    #[test]
    fn test_round_robin_skips_main() {
        let reg = ThreadRegistry::new(4);
        assert_eq!(reg.claim(), Ok(1));
        assert_eq!(reg.claim(), Ok(2));
        reg.release(1);
        // The cursor moves on before wrapping back to the freed slot.
        assert_eq!(reg.claim(), Ok(3));
        assert_eq!(reg.claim(), Ok(1));
        assert_eq!(
            reg.claim(),
            Err(MallocError::ThreadSlotsExhausted { capacity: 4 })
        );
        assert_eq!(reg.active(), 3);
    }

    #[test]
    fn test_capacity_is_clamped() {
        assert_eq!(ThreadRegistry::new(0).capacity(), 2);
        assert_eq!(ThreadRegistry::new(1 << 20).capacity(), MAX_THREAD_CAPACITY);
    }

    #[test]
    fn test_release_out_of_range_is_ignored() {
        let reg = ThreadRegistry::new(2);
        reg.release(500);
        assert_eq!(reg.claim(), Ok(1));
        assert!(reg.claim().is_err());
    }
}
