//! Scratch arena owned by one engine.
//!
//! Every buffer is sized once for the engine's maximum input and reused by
//! every sort. Reuse is only possible through [`ScratchArena::begin_sort`],
//! which resets the full logical extent of every scratch buffer before
//! handing out a [`SortScratch`]; nothing relies on allocator zeroing.

use forge_compute::DeviceBuffer;

use crate::layout::SortLayout;
use crate::scan::{lookback_blocks, MAX_SPINE_BLOCKS};
use crate::status::StatusRegister;

/// Words of lookback statistics: `[fallbacks, stalls]`.
pub const LOOKBACK_STAT_WORDS: usize = 2;

/// Lookback cells needed for up to `max_keys` keys: a seed row plus one
/// row per partition of `radix` columns for OneSweep, or one single-cell
/// row per block for the lookback scan.
pub fn cell_capacity(layout: &SortLayout, max_keys: usize) -> usize {
    let max_keys = max_keys.max(1);
    let partitions = layout.partitions(max_keys) as usize;
    let radix = layout.radix() as usize;
    ((partitions + 1) * radix).max(lookback_blocks(layout.table_len(max_keys)) + 1)
}

/// Device buffers for the whole lifetime of an engine.
#[derive(Debug)]
pub struct ScratchArena {
    max_keys: usize,
    keys: [DeviceBuffer; 2],
    payloads: [DeviceBuffer; 2],
    counts: DeviceBuffer,
    offsets: DeviceBuffer,
    reduced: DeviceBuffer,
    cells: DeviceBuffer,
    digit_base: DeviceBuffer,
    ticket: DeviceBuffer,
    stats: DeviceBuffer,
    status: StatusRegister,
}

impl ScratchArena {
    pub fn new(layout: &SortLayout, max_keys: usize) -> Self {
        let max_keys = max_keys.max(1);
        let radix = layout.radix() as usize;
        let table = layout.table_len(max_keys);
        let cells = cell_capacity(layout, max_keys);
        Self {
            max_keys,
            keys: [
                DeviceBuffer::new("keys_ping", max_keys),
                DeviceBuffer::new("keys_pong", max_keys),
            ],
            payloads: [
                DeviceBuffer::new("payloads_ping", max_keys),
                DeviceBuffer::new("payloads_pong", max_keys),
            ],
            counts: DeviceBuffer::new("digit_counts", table),
            offsets: DeviceBuffer::new("digit_offsets", table),
            reduced: DeviceBuffer::new("scan_reduced", MAX_SPINE_BLOCKS),
            cells: DeviceBuffer::new("lookback_cells", cells),
            digit_base: DeviceBuffer::new("digit_base", layout.passes() as usize * radix),
            ticket: DeviceBuffer::new("partition_ticket", 1),
            stats: DeviceBuffer::new("lookback_stats", LOOKBACK_STAT_WORDS),
            status: StatusRegister::new(),
        }
    }

    pub fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Total scratch footprint in bytes.
    pub fn byte_len(&self) -> usize {
        self.keys.iter().chain(&self.payloads).map(|b| b.byte_len()).sum::<usize>()
            + [
                &self.counts,
                &self.offsets,
                &self.reduced,
                &self.cells,
                &self.digit_base,
                &self.ticket,
                &self.stats,
            ]
            .iter()
            .map(|b| b.byte_len())
            .sum::<usize>()
    }

    /// Reset all scratch state and upload the input into the ping buffers.
    ///
    /// `keys` and `payloads` must have equal length no larger than `max_keys`.
    pub fn begin_sort(
        &mut self,
        layout: &SortLayout,
        keys: &[u32],
        payloads: &[u32],
    ) -> SortScratch<'_> {
        debug_assert_eq!(keys.len(), payloads.len());
        self.counts.fill(0);
        self.offsets.fill(0);
        self.reduced.fill(0);
        self.cells.fill(0);
        self.digit_base.fill(0);
        self.ticket.fill(0);
        self.stats.fill(0);
        self.status.reset();

        self.keys[0].upload(keys);
        self.payloads[0].upload(payloads);

        SortScratch {
            arena: self,
            len: keys.len(),
            partitions: layout.partitions(keys.len()),
            table_len: layout.table_len(keys.len()),
            current: 0,
        }
    }
}

/// The arena as seen by one sort, with the ping-pong roles for the current pass.
pub struct SortScratch<'a> {
    arena: &'a ScratchArena,
    len: usize,
    partitions: u32,
    table_len: usize,
    current: usize,
}

impl<'a> SortScratch<'a> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// Live entries of the histogram and offset tables.
    pub fn table_len(&self) -> usize {
        self.table_len
    }

    pub fn src_keys(&self) -> &'a DeviceBuffer {
        &self.arena.keys[self.current]
    }

    pub fn src_payloads(&self) -> &'a DeviceBuffer {
        &self.arena.payloads[self.current]
    }

    pub fn dst_keys(&self) -> &'a DeviceBuffer {
        &self.arena.keys[1 - self.current]
    }

    pub fn dst_payloads(&self) -> &'a DeviceBuffer {
        &self.arena.payloads[1 - self.current]
    }

    /// Swap source and destination after a scatter.
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    pub fn counts(&self) -> &'a DeviceBuffer {
        &self.arena.counts
    }

    pub fn offsets(&self) -> &'a DeviceBuffer {
        &self.arena.offsets
    }

    pub fn reduced(&self) -> &'a DeviceBuffer {
        &self.arena.reduced
    }

    pub fn cells(&self) -> &'a DeviceBuffer {
        &self.arena.cells
    }

    pub fn digit_base(&self) -> &'a DeviceBuffer {
        &self.arena.digit_base
    }

    pub fn ticket(&self) -> &'a DeviceBuffer {
        &self.arena.ticket
    }

    pub fn stats(&self) -> &'a DeviceBuffer {
        &self.arena.stats
    }

    pub fn status(&self) -> &'a StatusRegister {
        &self.arena.status
    }

    /// `(fallbacks, stalls)` accumulated by lookback kernels in this sort.
    pub fn lookback_stats(&self) -> (u32, u32) {
        (self.arena.stats.load(0), self.arena.stats.load(1))
    }

    /// Read back the buffers holding the current source role.
    pub fn read_current(&self) -> (Vec<u32>, Vec<u32>) {
        (self.src_keys().read(self.len), self.src_payloads().read(self.len))
    }
}
