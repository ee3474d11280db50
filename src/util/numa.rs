//! NUMA node discovery and memory binding. Binding is advisory: a failed
//! `mbind` downgrades to a warning, never an abort.

use crate::util::Address;

/// A NUMA node id. `NUMA_INTERLEAVE` asks for interleaved placement across
/// all nodes instead of a single node.
pub type NumaNode = i32;

pub const NUMA_INTERLEAVE: NumaNode = -1;

#[cfg(target_os = "linux")]
pub fn available() -> bool {
    std::path::Path::new("/sys/devices/system/node/node0").exists()
}

#[cfg(not(target_os = "linux"))]
pub fn available() -> bool {
    false
}

/// Number of NUMA nodes on this host (1 when discovery is unavailable).
#[cfg(target_os = "linux")]
pub fn n_nodes() -> usize {
    let mut n = 0;
    while std::path::Path::new(&format!("/sys/devices/system/node/node{}", n)).exists() {
        n += 1;
    }
    n.max(1)
}

#[cfg(not(target_os = "linux"))]
pub fn n_nodes() -> usize {
    1
}

#[cfg(target_os = "linux")]
mod mpol {
    pub const MPOL_BIND: usize = 2;
    pub const MPOL_INTERLEAVE: usize = 3;
}

/// Bind `[addr, addr + len)` to `node`, or interleave it across all nodes
/// when `node` is `NUMA_INTERLEAVE`.
#[cfg(target_os = "linux")]
pub fn bind(addr: Address, len: usize, node: NumaNode) {
    let n = n_nodes();
    let (mode, mask) = if node == NUMA_INTERLEAVE {
        (mpol::MPOL_INTERLEAVE, (1u64 << n) - 1)
    } else {
        debug_assert!((node as usize) < n);
        (mpol::MPOL_BIND, 1u64 << node)
    };
    let max_node = 8 * std::mem::size_of::<u64>() + 1;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr.as_usize(),
            len,
            mode,
            &mask as *const u64,
            max_node,
            0usize,
        )
    };
    if ret != 0 {
        warn!(
            "mbind({}, {:#x}, node {}) failed: {}",
            addr,
            len,
            node,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn bind(_addr: Address, _len: usize, _node: NumaNode) {}
