//! The shared pool buffer.

use std::sync::Arc;

use shm_primitives::{HeapRegion, Region};

use crate::control::ControlWords;
use crate::error::PoolError;
use crate::layout::PoolSize;

/// Handle to one pool buffer.
///
/// Cloning shares the same bytes; the memory is released when the last clone
/// (harvester, writers, watcher threads) is dropped.
#[derive(Clone)]
pub struct PoolBuffer {
    region: Region,
    owner: Arc<Backing>,
}

enum Backing {
    Heap(#[allow(dead_code)] HeapRegion),
    #[cfg(unix)]
    Mapped(#[allow(dead_code)] mapped::Mapping),
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match &*self.owner {
            Backing::Heap(_) => "heap",
            #[cfg(unix)]
            Backing::Mapped(_) => "mapped",
        };
        f.debug_struct("PoolBuffer")
            .field("len", &self.region.len())
            .field("backing", &backing)
            .finish_non_exhaustive()
    }
}

impl PoolBuffer {
    /// Allocate a zeroed, process-private buffer with initialised control words.
    pub fn allocate(size: PoolSize) -> Self {
        let heap = HeapRegion::new_zeroed(size.bytes());
        let buffer = Self {
            region: heap.region(),
            owner: Arc::new(Backing::Heap(heap)),
        };
        buffer.initialize();
        buffer
    }

    /// Create (or truncate) `path`, size it, map it shared and initialise it.
    ///
    /// Other processes can map the same file with [`PoolBuffer::open_file`].
    #[cfg(unix)]
    pub fn create_file(
        path: impl AsRef<std::path::Path>,
        size: PoolSize,
    ) -> Result<Self, PoolError> {
        let mapping = mapped::Mapping::create(path.as_ref(), size.bytes())?;
        let buffer = Self {
            region: mapping.region(),
            owner: Arc::new(Backing::Mapped(mapping)),
        };
        buffer.initialize();
        Ok(buffer)
    }

    /// Map an existing pool file without touching its contents.
    #[cfg(unix)]
    pub fn open_file(path: impl AsRef<std::path::Path>) -> Result<Self, PoolError> {
        let mapping = mapped::Mapping::open(path.as_ref())?;
        Ok(Self {
            region: mapping.region(),
            owner: Arc::new(Backing::Mapped(mapping)),
        })
    }

    #[cfg(not(unix))]
    pub fn create_file(
        _path: impl AsRef<std::path::Path>,
        _size: PoolSize,
    ) -> Result<Self, PoolError> {
        Err(PoolError::SharedMemoryUnavailable)
    }

    #[cfg(not(unix))]
    pub fn open_file(_path: impl AsRef<std::path::Path>) -> Result<Self, PoolError> {
        Err(PoolError::SharedMemoryUnavailable)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// The supported size this buffer has, if any.
    pub fn pool_size(&self) -> Option<PoolSize> {
        PoolSize::from_len(self.len())
    }

    /// Whether both handles refer to the same bytes.
    pub fn same_buffer(&self, other: &PoolBuffer) -> bool {
        self.region.as_ptr() == other.region.as_ptr()
    }

    #[inline]
    pub(crate) fn region(&self) -> Region {
        self.region
    }

    /// The atomic words at the start of the buffer.
    #[inline]
    pub fn control(&self) -> &ControlWords {
        // SAFETY: every supported size is larger than the control words, the
        // region base is 64-byte aligned, and zeroed bytes are valid atomics.
        // These are core atomics: this module is not built under loom.
        unsafe { self.region.get::<ControlWords>(0) }
    }

    pub(crate) fn initialize(&self) {
        self.control().init();
    }

    /// Plain byte-for-byte copy of the whole buffer.
    ///
    /// Not synchronised with writers: callers quiesce them first.
    pub(crate) fn snapshot(&self) -> Vec<u8> {
        let len = self.region.len();
        let mut out = Vec::with_capacity(len);
        // SAFETY: the region is valid for `len` bytes and `out` has that capacity.
        unsafe {
            std::ptr::copy_nonoverlapping(self.region.as_ptr(), out.as_mut_ptr(), len);
            out.set_len(len);
        }
        out
    }
}

#[cfg(unix)]
mod mapped {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;
    use std::ptr::NonNull;

    use shm_primitives::Region;

    use crate::error::PoolError;
    use crate::layout::PoolSize;

    /// A `MAP_SHARED` file mapping.
    pub(super) struct Mapping {
        base: NonNull<u8>,
        len: usize,
        /// Kept open for the lifetime of the mapping.
        _file: File,
    }

    // SAFETY: the mapping is only accessed through the pool protocol.
    unsafe impl Send for Mapping {}
    unsafe impl Sync for Mapping {}

    impl Drop for Mapping {
        fn drop(&mut self) {
            // SAFETY: base and len came from a successful mmap.
            unsafe {
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }

    impl Mapping {
        pub(super) fn create(path: &Path, len: usize) -> Result<Self, PoolError> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.set_len(len as u64)?;
            tracing::debug!(path = %path.display(), len, "created pool file");
            Self::map(file, len)
        }

        pub(super) fn open(path: &Path) -> Result<Self, PoolError> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let len = file.metadata()?.len() as usize;
            if PoolSize::from_len(len).is_none() {
                return Err(PoolError::UnsupportedSize(len));
            }
            Self::map(file, len)
        }

        fn map(file: File, len: usize) -> Result<Self, PoolError> {
            // SAFETY: mapping a regular file we hold open, with its full length.
            let addr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if addr == libc::MAP_FAILED {
                return Err(PoolError::Io(io::Error::last_os_error()));
            }
            let base = NonNull::new(addr as *mut u8)
                .ok_or_else(|| PoolError::Io(io::Error::other("mmap returned null")))?;

            Ok(Self {
                base,
                len,
                _file: file,
            })
        }

        pub(super) fn region(&self) -> Region {
            // SAFETY: mmap returns page-aligned memory valid until munmap in Drop.
            unsafe { Region::from_raw(self.base, self.len) }
        }
    }
}
