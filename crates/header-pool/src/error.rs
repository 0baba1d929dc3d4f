use std::io;

/// Errors from constructing or attaching to a header pool.
///
/// Write-time rejections are not errors; they are reported as
/// [`WriteResult`](crate::WriteResult) values.
#[derive(Debug)]
pub enum PoolError {
    /// Buffer length is not one of the supported pool sizes.
    UnsupportedSize(usize),
    /// Buffer length differs from the layout a writer was handed.
    LayoutMismatch { expected: usize, found: usize },
    /// Layout offsets or slot count disagree with its own size and header
    /// width.
    InconsistentLayout,
    /// Configuration cannot produce a usable layout.
    InvalidConfig(&'static str),
    /// Shared mappings are not available on this platform.
    SharedMemoryUnavailable,
    /// I/O error while creating or mapping a backing file.
    Io(io::Error),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedSize(len) => write!(
                f,
                "unsupported pool size: {} bytes (expected 8192, 16384, 32768 or 65536)",
                len
            ),
            Self::LayoutMismatch { expected, found } => write!(
                f,
                "layout mismatch: layout describes {} bytes, buffer has {}",
                expected, found
            ),
            Self::InconsistentLayout => {
                write!(f, "layout offsets do not match its size and header width")
            }
            Self::InvalidConfig(msg) => write!(f, "invalid pool config: {}", msg),
            Self::SharedMemoryUnavailable => {
                write!(f, "shared memory mappings are not supported on this platform")
            }
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PoolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
