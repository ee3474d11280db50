//! L0: one-sided transport over a process group.

pub mod comm;
pub mod window;

pub use self::comm::{BarrierRequest, Comm, Rank};
pub use self::window::Window;
