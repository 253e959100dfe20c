//! Device-visible storage buffers.
//!
//! A [`DeviceBuffer`] is a fixed-length array of 32-bit words that every group
//! of a dispatch may read and write concurrently. Plain data traffic uses
//! relaxed ordering: the end of a dispatch is the synchronization point that
//! makes one dispatch's writes visible to the next. Cross-group signaling
//! inside a single dispatch (lookback status cells, tickets) must use the
//! acquire/release accessors.

use std::sync::atomic::{AtomicU32, Ordering};

/// A fixed-length storage buffer of `u32` words.
pub struct DeviceBuffer {
    label: &'static str,
    words: Box<[AtomicU32]>,
}

impl DeviceBuffer {
    /// Allocate a zero-filled buffer of `len` words.
    pub fn new(label: &'static str, len: usize) -> Self {
        let words = (0..len).map(|_| AtomicU32::new(0)).collect();
        Self { label, words }
    }

    /// Allocate a buffer initialized with `data`.
    pub fn with_data(label: &'static str, data: &[u32]) -> Self {
        let words = data.iter().map(|&v| AtomicU32::new(v)).collect();
        Self { label, words }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Length in words.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Size in bytes.
    pub fn byte_len(&self) -> usize {
        self.words.len() * std::mem::size_of::<u32>()
    }

    #[inline]
    pub fn load(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Relaxed)
    }

    #[inline]
    pub fn load_acquire(&self, index: usize) -> u32 {
        self.words[index].load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_release(&self, index: usize, value: u32) {
        self.words[index].store(value, Ordering::Release)
    }

    /// Device-scope atomic add. Returns the previous value.
    #[inline]
    pub fn fetch_add(&self, index: usize, value: u32) -> u32 {
        self.words[index].fetch_add(value, Ordering::AcqRel)
    }

    /// Device-scope compare-and-swap with acquire/release semantics.
    #[inline]
    pub fn compare_exchange(&self, index: usize, current: u32, new: u32) -> Result<u32, u32> {
        self.words[index].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Fill `range` with `value` from the host.
    pub fn fill_range(&self, range: std::ops::Range<usize>, value: u32) {
        for word in &self.words[range] {
            word.store(value, Ordering::Relaxed);
        }
    }

    /// Fill the whole buffer with `value` from the host.
    pub fn fill(&self, value: u32) {
        self.fill_range(0..self.words.len(), value);
    }

    /// Copy `data` into the start of the buffer.
    ///
    /// Panics if `data` is longer than the buffer.
    pub fn upload(&self, data: &[u32]) {
        assert!(
            data.len() <= self.words.len(),
            "upload of {} words exceeds buffer '{}' capacity {}",
            data.len(),
            self.label,
            self.words.len()
        );
        for (word, &v) in self.words.iter().zip(data) {
            word.store(v, Ordering::Relaxed);
        }
    }

    /// Read back the first `count` words.
    pub fn read(&self, count: usize) -> Vec<u32> {
        self.words[..count]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect()
    }

    /// Read back the whole buffer.
    pub fn to_vec(&self) -> Vec<u32> {
        self.read(self.words.len())
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("len", &self.words.len())
            .finish()
    }
}
