/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a gigabyte
pub const LOG_BYTES_IN_GBYTE: u8 = 30;
/// The number of bytes in a gigabyte
pub const BYTES_IN_GBYTE: usize = 1 << LOG_BYTES_IN_GBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in an OS page. We assume 4K pages; `init()`
/// verifies the assumption against `sysconf`.
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in an OS page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the default coherence block size (64 KiB). The block is the unit
/// of the cache directory, the dirty bitmaps and all home-page RMA.
pub const LOG_DEFAULT_BLOCK_SIZE: u8 = 16;
/// The default coherence block size
pub const DEFAULT_BLOCK_SIZE: usize = 1 << LOG_DEFAULT_BLOCK_SIZE;

/// The default physical cache pool size per rank
pub const DEFAULT_CACHE_SIZE: usize = 16 << LOG_BYTES_IN_MBYTE;

/// The default per-rank arena for noncollective allocations
pub const DEFAULT_LOCAL_HEAP_SIZE: usize = 16 << LOG_BYTES_IN_MBYTE;

/// Ceiling for the size-doubling heuristic during collective virtual address
/// reservation (1 TiB).
pub const MAX_RESERVATION_SIZE: usize = 1 << 40;

/// Default bound on reservation rounds before the job aborts
pub const DEFAULT_MAX_RESERVATION_TRIALS: usize = 100;
