//! Thin wrappers over the OS memory mapping calls. Callers decide which
//! failures are fatal; everything here reports `io::Result`.

use std::ffi::CString;
use std::io::{Error, Result};
use std::os::unix::io::RawFd;

use crate::util::conversions;
use crate::util::Address;

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn mmap_result(ret: *mut libc::c_void) -> Result<Address> {
    if ret == libc::MAP_FAILED {
        Err(Error::last_os_error())
    } else {
        Ok(Address::from_mut_ptr(ret))
    }
}

/// Reserve `size` bytes of virtual address space anywhere, with no physical
/// backing (PROT_NONE).
pub fn mmap_reserve(size: usize) -> Result<Address> {
    debug_assert!(size > 0);
    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    mmap_result(ret)
}

/// Reserve `size` bytes at exactly `addr`, failing (rather than replacing)
/// when any part of the range is already mapped. The conflict outcome is the
/// expected one during collective reservation; use [`is_conflict`] to tell it
/// apart from genuine failures.
#[cfg(target_os = "linux")]
pub fn mmap_reserve_at(addr: Address, size: usize) -> Result<Address> {
    debug_assert!(conversions::is_page_aligned(addr));
    let ret = unsafe {
        libc::mmap(
            addr.to_mut_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    mmap_result(ret)
}

/// Portable emulation of no-replace mapping: map with a hint and report a
/// conflict if the kernel placed the range elsewhere.
#[cfg(not(target_os = "linux"))]
pub fn mmap_reserve_at(addr: Address, size: usize) -> Result<Address> {
    debug_assert!(conversions::is_page_aligned(addr));
    let ret = unsafe {
        libc::mmap(
            addr.to_mut_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    let got = mmap_result(ret)?;
    if got != addr {
        munmap(got, size)?;
        return Err(Error::from_raw_os_error(libc::EEXIST));
    }
    Ok(got)
}

/// Does this error mean "the address range is already in use"?
pub fn is_conflict(e: &Error) -> bool {
    e.raw_os_error() == Some(libc::EEXIST)
}

/// Map `size` bytes of `fd` starting at file offset `file_off` read-write at
/// exactly `addr`, replacing whatever reservation is there. This is how home
/// segments and cache pool slots are installed into a region view.
pub fn mmap_shared_fixed(addr: Address, size: usize, fd: RawFd, file_off: usize) -> Result<Address> {
    debug_assert!(conversions::is_page_aligned(addr));
    debug_assert!(conversions::raw_is_aligned(file_off, page_size()));
    let ret = unsafe {
        libc::mmap(
            addr.to_mut_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            file_off as libc::off_t,
        )
    };
    mmap_result(ret)
}

/// Return `[addr, addr + size)` to the reserved-but-unbacked state, keeping
/// the range claimed so later slot installs can MAP_FIXED into it.
pub fn mmap_discard(addr: Address, size: usize) -> Result<()> {
    let ret = unsafe {
        libc::mmap(
            addr.to_mut_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    mmap_result(ret).map(|_| ())
}

pub fn munmap(addr: Address, size: usize) -> Result<()> {
    debug_assert!(conversions::is_page_aligned(addr));
    debug_assert!(size > 0);
    let ret = unsafe { libc::munmap(addr.to_mut_ptr(), size) };
    if ret != 0 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Create an anonymous shareable memory object of `size` bytes. The pages are
/// zero on first touch; window and pool contents are therefore
/// zero-initialized without any per-element construction.
#[cfg(target_os = "linux")]
pub fn memfd_create(name: &str, size: usize) -> Result<RawFd> {
    let cname = CString::new(name).unwrap();
    let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    if size > 0 && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        let e = Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
pub fn memfd_create(name: &str, size: usize) -> Result<RawFd> {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let uniq = format!(
        "/{}-{}-{}",
        name,
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let cname = CString::new(uniq).unwrap();
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o600) };
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    unsafe { libc::shm_unlink(cname.as_ptr()) };
    if size > 0 && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
        let e = Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(e);
    }
    Ok(fd)
}

pub fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn os_page_size_matches_constant() {
        assert_eq!(page_size(), BYTES_IN_PAGE);
    }

    #[test]
    fn reserve_at_rejects_overlap() {
        let size = 4 * BYTES_IN_PAGE;
        let addr = mmap_reserve(size).unwrap();
        let err = mmap_reserve_at(addr, size).unwrap_err();
        assert!(is_conflict(&err));
        munmap(addr, size).unwrap();
    }

    #[test]
    fn shared_mapping_round_trip() {
        let size = 2 * BYTES_IN_PAGE;
        let fd = memfd_create("pgas-test", size).unwrap();
        let addr = mmap_reserve(size).unwrap();
        mmap_shared_fixed(addr, size, fd, 0).unwrap();
        unsafe {
            addr.store(0xdead_beefu64);
            assert_eq!(addr.load::<u64>(), 0xdead_beefu64);
        }
        mmap_discard(addr, size).unwrap();
        munmap(addr, size).unwrap();
        close(fd);
    }
}
