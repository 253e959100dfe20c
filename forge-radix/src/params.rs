//! Uniform blocks handed to the sort kernels.
//!
//! All param structs are #[repr(C)] and 16 bytes, the layout a GPU
//! constant buffer binding expects. The GPU backend binds them as uniforms
//! at binding 1 of every kernel that takes parameters.

use bytemuck::{Pod, Zeroable};

/// Per-pass parameters for histogram, scatter and OneSweep kernels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SortParams {
    pub key_count: u32,
    pub shift: u32,
    pub partition_count: u32,
    pub pass: u32,
}

impl SortParams {
    pub fn new(key_count: usize, shift: u32, partition_count: u32, pass: u32) -> Self {
        Self {
            key_count: key_count as u32,
            shift,
            partition_count,
            pass,
        }
    }
}

/// Parameters for the scan kernels over a flat table.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ScanParams {
    pub element_count: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub _pad: u32,
}

impl ScanParams {
    pub fn new(element_count: usize, block_size: u32) -> Self {
        let block_count = (element_count as u32).div_ceil(block_size);
        Self {
            element_count: element_count as u32,
            block_size,
            block_count,
            _pad: 0,
        }
    }

    /// Index range of block `block`.
    #[inline]
    pub fn block_range(&self, block: u32) -> std::ops::Range<usize> {
        let start = (block * self.block_size).min(self.element_count) as usize;
        let end = ((block + 1) * self.block_size).min(self.element_count) as usize;
        start..end
    }
}

/// Parameters for resetting `cell_count` lookback cells whose first
/// `columns` cells form the seed row.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ResetParams {
    pub cell_count: u32,
    pub columns: u32,
    pub _pad: [u32; 2],
}

impl ResetParams {
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            cell_count: (rows * columns) as u32,
            columns: columns as u32,
            _pad: [0; 2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_params_layout() {
        assert_eq!(
            std::mem::size_of::<SortParams>(),
            16,
            "SortParams must be 16 bytes"
        );
        assert_eq!(std::mem::align_of::<SortParams>(), 4);
    }

    #[test]
    fn test_scan_params_layout() {
        assert_eq!(
            std::mem::size_of::<ScanParams>(),
            16,
            "ScanParams must be 16 bytes"
        );
    }

    #[test]
    fn test_params_upload_as_words() {
        let params = SortParams::new(5000, 8, 3, 1);
        assert_eq!(bytemuck::cast::<SortParams, [u32; 4]>(params), [5000, 8, 3, 1]);
        let reset = ResetParams::new(4, 256);
        assert_eq!(bytemuck::bytes_of(&reset).len(), 16);
        assert_eq!((reset.cell_count, reset.columns), (1024, 256));
    }

    #[test]
    fn test_scan_block_ranges() {
        let params = ScanParams::new(2500, 1024);
        assert_eq!(params.block_count, 3);
        assert_eq!(params.block_range(0), 0..1024);
        assert_eq!(params.block_range(2), 2048..2500);
        assert_eq!(params.block_range(3), 2500..2500);
    }
}
