//! Volatile cells conforming to the RAL's register API, plus the volatile
//! slice copies used for endpoint memory I/O.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
}

/// Copy `src` into the cells, one volatile write per byte.
///
/// # Panics
///
/// Panics if `src` is larger than `cells`.
pub fn write_bytes(cells: &[VCell<u8>], src: &[u8]) {
    assert!(src.len() <= cells.len());
    cells
        .iter()
        .zip(src.iter())
        .for_each(|(cell, byte)| cell.write(*byte));
}

/// Copy out of the cells into `dst`, one volatile read per byte.
///
/// Returns the number of bytes read, bounded by the smaller of the two
/// slices.
pub fn read_bytes(cells: &[VCell<u8>], dst: &mut [u8]) -> usize {
    let size = cells.len().min(dst.len());
    dst.iter_mut()
        .zip(cells.iter())
        .take(size)
        .for_each(|(byte, cell)| *byte = cell.read());
    size
}
