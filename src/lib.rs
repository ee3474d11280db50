//! A global-address-space runtime for fork/join parallelism over
//! software-cached distributed memory.
//!
//! The crate is organized in layers, dependencies pointing downward:
//!
//! * [`pattern`] / [`container`] — parallel algorithm templates (reduce,
//!   scan, search) and thin container types over global memory.
//! * [`sched`] — the work-stealing fork/join scheduler. Steals hand off
//!   in-flight coherence state so a stolen continuation sees a correctly
//!   synchronized view of memory.
//! * [`coherence`] — the page-grained cache coherence engine: checkout and
//!   checkin make global ranges CPU-accessible; lazy release and acquire
//!   order writes across fork/join points.
//! * [`gvm`] — partitioned global virtual memory: collective reservation of
//!   identical virtual ranges, home policies and region management.
//! * [`net`] — one-sided put/get/atomics, windows and collectives over the
//!   process group.
//!
//! A computation starts with [`api::init`], allocates with
//! [`api::malloc_coll`], and runs parallel work under [`api::root_exec`].
//! Global memory is touched only through checkouts ([`api::checkout`]) or
//! explicit [`api::get`]/[`api::put`].

extern crate libc;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod api;
pub mod coherence;
pub mod container;
pub mod gvm;
pub mod net;
pub mod pattern;
mod pgas;
pub mod sched;
pub mod util;

pub use crate::coherence::{Mode, ReleaseHandle};
pub use crate::container::{CheckoutSpan, GlobalSpan, GlobalVector};
pub use crate::gvm::PolicyKind;
pub use crate::pattern::{ParallelPolicy, SequencedPolicy};
pub use crate::util::{Address, GlobalPtr};
