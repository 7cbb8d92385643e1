//! Helpers for tests, benches and the perf binary: page-aligned buffers to
//! serve as symmetric segments.

use crate::error::{Result, TransportError};
use crate::segment::SegmentLayout;

/// Page size for aligned allocations.
pub const PAGE_SIZE: usize = 4096;

/// Page-aligned, zeroed buffer freed on drop.
///
/// Remote PEs write into it through the fabric while the owner holds a
/// shared reference, so every accessor goes through volatile reads.
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self> {
        let aligned_size = (size.max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut ptr, PAGE_SIZE, aligned_size) };
        if ret != 0 {
            return Err(TransportError::Allocation {
                what: "aligned buffer",
                source: std::io::Error::from_raw_os_error(ret),
            });
        }
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, aligned_size) };
        Ok(Self {
            ptr: ptr as *mut u8,
            size: aligned_size,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Pointer `offset` bytes in, for naming symmetric objects.
    pub fn at(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.size);
        unsafe { self.ptr.add(offset) }
    }

    pub fn fill(&self, pattern: u8) {
        unsafe { std::ptr::write_bytes(self.ptr, pattern, self.size) };
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.size);
        (0..len)
            .map(|i| unsafe { std::ptr::read_volatile(self.ptr.add(offset + i)) })
            .collect()
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.size);
        for (i, b) in data.iter().enumerate() {
            unsafe { std::ptr::write_volatile(self.ptr.add(offset + i), *b) };
        }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= self.size);
        unsafe { std::ptr::read_volatile(self.ptr.add(offset) as *const u32) }
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.size);
        unsafe { std::ptr::read_volatile(self.ptr.add(offset) as *const u64) }
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.size);
        unsafe { std::ptr::write_volatile(self.ptr.add(offset) as *mut u64, value) };
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr as *mut libc::c_void) };
    }
}

/// A PE's two symmetric segments.
pub struct SymmetricHeap {
    pub data: AlignedBuffer,
    pub heap: AlignedBuffer,
}

impl SymmetricHeap {
    pub fn new(data_len: usize, heap_len: usize) -> Result<Self> {
        Ok(Self {
            data: AlignedBuffer::new(data_len)?,
            heap: AlignedBuffer::new(heap_len)?,
        })
    }

    /// Layout over both buffers. The heap must outlive any transport the
    /// layout is registered with.
    pub fn layout(&self) -> SegmentLayout {
        unsafe {
            SegmentLayout::new(
                (self.data.as_ptr(), self.data.size()),
                (self.heap.as_ptr(), self.heap.size()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_page_aligned_and_zeroed() {
        let buf = AlignedBuffer::new(100).unwrap();
        assert_eq!(buf.addr() as usize % PAGE_SIZE, 0);
        assert_eq!(buf.size(), PAGE_SIZE);
        assert!(buf.read_bytes(0, buf.size()).iter().all(|&b| b == 0));

        buf.write_u64(8, 0x0102_0304_0506_0708);
        assert_eq!(buf.read_u64(8), 0x0102_0304_0506_0708);
        buf.write_bytes(64, b"abc");
        assert_eq!(buf.read_bytes(64, 3), b"abc");
    }

    #[test]
    fn layout_covers_both_buffers() {
        let heap = SymmetricHeap::new(4096, 8192).unwrap();
        let layout = heap.layout();
        assert_eq!(layout.data.base(), heap.data.as_ptr());
        assert_eq!(layout.heap.len(), 8192);
    }
}
