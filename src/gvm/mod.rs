//! L1: partitioned global virtual memory — collective reservation of
//! identical virtual ranges, home policies and region management.

pub mod mem_mapper;
pub mod region;
pub mod virtual_mem;

pub use self::mem_mapper::{HomePolicy, NumaSegment, PolicyKind, Segment};
pub use self::region::{LocalHeap, Region, RegionConfig};
pub use self::virtual_mem::{reserve_same_vm, VirtualMem};
