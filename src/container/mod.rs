//! Thin container types over global memory.

pub mod checkout_span;
pub mod global_span;
pub mod global_vector;

pub use self::checkout_span::{make_checkout, make_checkout_nb, CheckoutSpan};
pub use self::global_span::GlobalSpan;
pub use self::global_vector::GlobalVector;
