use std::io;

use tracing::debug;

use crate::error::{Error, Result};

/// Fixed-capacity ring of full serialized states for instant rewind.
///
/// Every slot is allocated up-front at init so out-of-memory happens
/// early and recoverably, not mid-game. Capacity and state size are
/// immutable until the next game load rebuilds the ring.
pub(crate) struct RewindRing {
    slots: Vec<Box<[u8]>>,
    state_size: usize,
    /// Next slot to write.
    head: usize,
    count: usize,
}

impl RewindRing {
    pub fn new(capacity: usize, state_size: usize) -> Result<Self> {
        if capacity == 0 || state_size == 0 {
            return Err(Error::State("rewind needs a capacity and a state size"));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| out_of_memory())?;

        // Individual heap buffers rather than one large allocation: a
        // failure partway simply drops what was built so far.
        for _ in 0..capacity {
            let mut slot = Vec::new();
            slot.try_reserve_exact(state_size).map_err(|_| out_of_memory())?;
            slot.resize(state_size, 0);
            slots.push(slot.into_boxed_slice());
        }

        debug!(capacity, state_size, "rewind ring allocated");

        Ok(Self {
            slots,
            state_size,
            head: 0,
            count: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// Capture a snapshot into the head slot; the oldest snapshot is
    /// overwritten once the ring is full.
    pub fn push(&mut self, serialize: impl FnOnce(&mut [u8]) -> bool) -> Result<()> {
        if !serialize(&mut self.slots[self.head]) {
            return Err(Error::State("core failed to serialize"));
        }

        self.head = (self.head + 1) % self.capacity();
        self.count = (self.count + 1).min(self.capacity());

        Ok(())
    }

    /// Step back one snapshot, restoring the most recent capture.
    pub fn pop(&mut self, restore: impl FnOnce(&[u8]) -> bool) -> Result<()> {
        if self.count == 0 {
            return Err(Error::State("rewind history is empty"));
        }

        self.head = (self.head + self.capacity() - 1) % self.capacity();
        self.count -= 1;

        if !restore(&self.slots[self.head]) {
            return Err(Error::State("core rejected the snapshot"));
        }

        Ok(())
    }
}

fn out_of_memory() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::OutOfMemory,
        "rewind ring allocation failed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serializer stamping the whole buffer with a marker byte.
    fn stamp(marker: u8) -> impl FnOnce(&mut [u8]) -> bool {
        move |buf| {
            buf.fill(marker);
            true
        }
    }

    #[test]
    fn count_stays_within_capacity() {
        let mut ring = RewindRing::new(3, 16).unwrap();

        for marker in 1..=5u8 {
            ring.push(stamp(marker)).unwrap();
            assert!(ring.count() <= 3);
        }

        assert_eq!(ring.count(), 3);
    }

    #[test]
    fn overflow_keeps_the_newest_and_pops_in_reverse_order() {
        let mut ring = RewindRing::new(3, 4).unwrap();
        for marker in 1..=5u8 {
            ring.push(stamp(marker)).unwrap();
        }

        let mut recovered = Vec::new();
        for _ in 0..3 {
            ring.pop(|buf| {
                recovered.push(buf[0]);
                true
            })
            .unwrap();
        }

        assert_eq!(recovered, vec![5, 4, 3]);
        assert!(matches!(
            ring.pop(|_| true),
            Err(Error::State(_))
        ));
    }

    #[test]
    fn push_after_pop_overwrites_the_popped_slot() {
        let mut ring = RewindRing::new(2, 4).unwrap();
        ring.push(stamp(1)).unwrap();
        ring.push(stamp(2)).unwrap();
        ring.pop(|buf| buf[0] == 2).unwrap();
        ring.push(stamp(9)).unwrap();

        ring.pop(|buf| {
            assert_eq!(buf[0], 9);
            true
        })
        .unwrap();
    }

    #[test]
    fn serialize_failure_does_not_advance() {
        let mut ring = RewindRing::new(2, 4).unwrap();

        assert!(ring.push(|_| false).is_err());
        assert_eq!(ring.count(), 0);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(RewindRing::new(0, 4).is_err());
        assert!(RewindRing::new(4, 0).is_err());
    }
}
