//! A minimal owned global array. Collective vectors are allocated by all
//! ranks together (outside `root_exec`); task-local vectors come from the
//! calling rank's noncollective heap and can be created and dropped inside
//! tasks — which is what accumulator-view reducers need for their global
//! output buffers.

use crate::api;
use crate::coherence::Mode;
use crate::container::{make_checkout, GlobalSpan};
use crate::util::GlobalPtr;

pub struct GlobalVector<T: Copy> {
    ptr: GlobalPtr<T>,
    len: usize,
    collective: bool,
}

// the pointee is global memory, not thread-affine state
unsafe impl<T: Copy> Send for GlobalVector<T> {}

impl<T: Copy + 'static> GlobalVector<T> {
    /// Collective allocation of `n` elements (uninitialized). Call outside
    /// `root_exec`, like `malloc_coll`.
    pub fn new_coll(n: usize) -> GlobalVector<T> {
        GlobalVector {
            ptr: api::malloc_coll(n),
            len: n,
            collective: true,
        }
    }

    /// Task-local allocation of `n` elements, homed on the calling rank and
    /// filled with `init`.
    pub fn new_local(n: usize, init: T) -> GlobalVector<T> {
        let ptr = api::malloc_local::<T>(n);
        let v = GlobalVector {
            ptr,
            len: n,
            collective: false,
        };
        let mut cs = make_checkout(v.as_span(), Mode::Write);
        cs.as_mut_slice().fill(init);
        v
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> GlobalPtr<T> {
        self.ptr
    }

    pub fn as_span(&self) -> GlobalSpan<T> {
        GlobalSpan::new(self.ptr, self.len)
    }

    pub fn get(&self, i: usize) -> T {
        assert!(i < self.len);
        api::get(self.ptr.add(i))
    }

    pub fn put(&self, i: usize, v: T) {
        assert!(i < self.len);
        api::put(self.ptr.add(i), v)
    }

    /// Give up ownership without freeing.
    pub fn into_raw(self) -> GlobalPtr<T> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl<T: Copy> Drop for GlobalVector<T> {
    fn drop(&mut self) {
        if self.ptr.is_null() || self.len == 0 {
            return;
        }
        if self.collective {
            // collective frees cannot run from a single rank's drop
            warn!("collective global vector leaked; free it with api::free_coll");
        } else {
            crate::sched::Worker::current()
                .engine()
                .free_local(self.ptr.raw(), self.len * std::mem::size_of::<T>());
        }
    }
}
