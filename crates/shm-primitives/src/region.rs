use core::mem::{align_of, size_of};
use core::ptr::NonNull;

/// Alignment every region base is guaranteed to have.
pub const REGION_ALIGN: usize = 64;

/// A raw view over a shared byte region.
///
/// `Region` does not own its memory: whoever created it (a [`HeapRegion`], an
/// mmap) must outlive every copy. It is `Copy` so protocol views can hold one
/// by value.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: all shared state inside a region is accessed through atomics or
// through disjoint slots coordinated by them.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Wrap raw memory.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `len` bytes for as long as
    /// this region (or any copy of it) is used, and aligned to [`REGION_ALIGN`].
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        debug_assert!(
            (base.as_ptr() as usize).is_multiple_of(REGION_ALIGN),
            "region base must be {REGION_ALIGN}-byte aligned"
        );
        Self { base, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Pointer to the byte at `offset`.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} out of bounds");
        // SAFETY: in bounds per the assertion above.
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Reference a `T` living at `offset`.
    ///
    /// # Safety
    ///
    /// The bytes at `offset` must hold a valid `T` (atomics over zeroed memory
    /// qualify), and mutation must only happen through interior mutability.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        assert!(
            offset + size_of::<T>() <= self.len,
            "{} bytes at offset {offset} exceed region of {} bytes",
            size_of::<T>(),
            self.len
        );
        assert!(
            offset.is_multiple_of(align_of::<T>()),
            "offset {offset} misaligned"
        );
        unsafe { &*(self.offset(offset) as *const T) }
    }

    /// Copy `src` into the region at `offset`.
    ///
    /// # Safety
    ///
    /// No one else may be reading or writing `offset..offset + src.len()`.
    #[inline]
    pub unsafe fn write_bytes(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "write out of bounds");
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), self.offset(offset), src.len()) };
    }

    /// Fill `offset..offset + len` with zeroes.
    ///
    /// # Safety
    ///
    /// Same exclusivity requirement as [`Region::write_bytes`].
    #[inline]
    pub unsafe fn zero_bytes(&self, offset: usize, len: usize) {
        assert!(offset + len <= self.len, "zeroing out of bounds");
        unsafe { core::ptr::write_bytes(self.offset(offset), 0, len) };
    }

    /// Borrow `offset..offset + len` as a byte slice.
    ///
    /// # Safety
    ///
    /// The bytes must not be written for the lifetime of the returned slice.
    #[inline]
    pub unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "read out of bounds");
        unsafe { core::slice::from_raw_parts(self.offset(offset), len) }
    }
}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::{REGION_ALIGN, Region};
    use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
    use core::ptr::NonNull;

    /// An owned, zero-initialised region on the heap.
    pub struct HeapRegion {
        base: NonNull<u8>,
        layout: Layout,
    }

    // SAFETY: see `Region`.
    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}

    impl HeapRegion {
        pub fn new_zeroed(len: usize) -> Self {
            assert!(len > 0, "region length must be > 0");
            let layout = match Layout::from_size_align(len, REGION_ALIGN) {
                Ok(layout) => layout,
                Err(_) => panic!("invalid region layout for {len} bytes"),
            };
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            let Some(base) = NonNull::new(ptr) else {
                handle_alloc_error(layout)
            };
            Self { base, layout }
        }

        pub fn region(&self) -> Region {
            // SAFETY: the allocation lives as long as `self` and is aligned.
            unsafe { Region::from_raw(self.base, self.layout.size()) }
        }

        pub fn len(&self) -> usize {
            self.layout.size()
        }

        pub fn is_empty(&self) -> bool {
            self.layout.size() == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            // SAFETY: allocated in `new_zeroed` with this exact layout.
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;
