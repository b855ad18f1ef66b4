use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free single-producer / single-consumer ring of interleaved stereo
/// int16 samples.
///
/// Capacity is a power of two. Indices live in `[0, capacity)` with a
/// one-slot gap, so `queued` is always `(write - read) mod capacity` and
/// free space is `capacity - 1 - queued`.
///
/// Protocol: the producer acquire-loads `read` before writing and
/// release-stores `write` after; the consumer mirrors it on the opposite
/// index. `catch_up` is the single sanctioned exception to strict SPSC --
/// the producer yanks `read` forward to shed latency. A pop racing that
/// store can replay a handful of stale samples, but both indices only ever
/// advance, so the counts stay coherent.
pub(crate) struct SampleRing {
    buf: UnsafeCell<Box<[i16]>>,
    mask: usize,
    read: AtomicUsize,
    write: AtomicUsize,
}

// The SPSC protocol above is what makes the UnsafeCell sound: each cell is
// written by at most one thread before the index covering it is published.
unsafe impl Sync for SampleRing {}
unsafe impl Send for SampleRing {}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());

        Self {
            buf: UnsafeCell::new(vec![0i16; capacity].into_boxed_slice()),
            mask: capacity - 1,
            read: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of queued samples, as seen by the caller's side.
    pub fn queued(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);

        write.wrapping_sub(read) & self.mask
    }

    pub fn free(&self) -> usize {
        self.capacity() - 1 - self.queued()
    }

    /// Producer: append `samples`, truncating to available space.
    /// Returns the number of samples written.
    pub fn push(&self, samples: &[i16]) -> usize {
        let read = self.read.load(Ordering::Acquire);
        let write = self.write.load(Ordering::Relaxed);
        let free = self.capacity() - 1 - (write.wrapping_sub(read) & self.mask);
        let n = samples.len().min(free);

        let buf = unsafe { &mut *self.buf.get() };
        for (i, &sample) in samples[..n].iter().enumerate() {
            buf[(write + i) & self.mask] = sample;
        }

        self.write.store((write + n) & self.mask, Ordering::Release);

        n
    }

    /// Consumer: fill `out` from the ring. Returns the number of samples
    /// copied; the tail of `out` is left untouched on a short read.
    pub fn pop_into(&self, out: &mut [i16]) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Relaxed);
        let queued = write.wrapping_sub(read) & self.mask;
        let n = out.len().min(queued);

        let buf = unsafe { &*self.buf.get() };
        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = buf[(read + i) & self.mask];
        }

        self.read.store((read + n) & self.mask, Ordering::Release);

        n
    }

    /// Producer-side latency shed: drop queued samples until only `keep`
    /// remain. Returns the number of samples discarded.
    pub fn catch_up(&self, keep: usize) -> usize {
        let write = self.write.load(Ordering::Relaxed);
        let read = self.read.load(Ordering::Acquire);
        let queued = write.wrapping_sub(read) & self.mask;

        if queued <= keep {
            return 0;
        }

        let dropped = queued - keep;
        self.read
            .store((read + dropped) & self.mask, Ordering::Release);

        dropped
    }

    pub fn clear(&self) {
        self.catch_up(0);
    }
}
