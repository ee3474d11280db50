//! The scoped checkout guard. Construction checks a global range out;
//! dropping it — on any exit path, including unwinding — checks it back in.
//! The guard is intentionally not `Send`: a checkout must not cross a
//! fork/join boundary, because the continuation may resume on another rank.

use std::mem::size_of;
use std::ops::{Deref, DerefMut};

use crate::coherence::Mode;
use crate::container::GlobalSpan;
use crate::sched::Worker;
use crate::util::GlobalPtr;

pub struct CheckoutSpan<T> {
    gptr: GlobalPtr<T>,
    ptr: *mut T,
    len: usize,
    mode: Mode,
}

impl<T> CheckoutSpan<T> {
    fn empty(mode: Mode) -> CheckoutSpan<T> {
        CheckoutSpan {
            gptr: GlobalPtr::null(),
            ptr: std::ptr::null_mut(),
            len: 0,
            mode,
        }
    }

    /// Blocking checkout of `[gptr, gptr + n)`.
    pub fn new(gptr: GlobalPtr<T>, n: usize, mode: Mode) -> CheckoutSpan<T> {
        if gptr.is_null() || n == 0 {
            return Self::empty(mode);
        }
        let view = Worker::current()
            .engine()
            .checkout(gptr.raw(), n * size_of::<T>(), mode);
        CheckoutSpan {
            gptr,
            ptr: view.to_mut_ptr(),
            len: n,
            mode,
        }
    }

    /// Non-blocking checkout; the data is valid only after
    /// `checkout_complete`.
    pub fn new_nb(gptr: GlobalPtr<T>, n: usize, mode: Mode) -> CheckoutSpan<T> {
        if gptr.is_null() || n == 0 {
            return Self::empty(mode);
        }
        let view = Worker::current()
            .engine()
            .checkout_nb(gptr.raw(), n * size_of::<T>(), mode);
        CheckoutSpan {
            gptr,
            ptr: view.to_mut_ptr(),
            len: n,
            mode,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn as_ptr(&self) -> *const T {
        self.ptr
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        debug_assert!(self.mode.is_write(), "mutating a read-only checkout");
        if self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<T> Deref for CheckoutSpan<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for CheckoutSpan<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T> Drop for CheckoutSpan<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            Worker::current()
                .engine()
                .checkin(self.gptr.raw(), self.len * size_of::<T>(), self.mode);
        }
    }
}

/// Checkout helper taking a span.
pub fn make_checkout<T>(span: GlobalSpan<T>, mode: Mode) -> CheckoutSpan<T> {
    CheckoutSpan::new(span.data(), span.len(), mode)
}

/// Non-blocking checkout helper; finish the batch with
/// `api::checkout_complete`.
pub fn make_checkout_nb<T>(span: GlobalSpan<T>, mode: Mode) -> CheckoutSpan<T> {
    CheckoutSpan::new_nb(span.data(), span.len(), mode)
}
