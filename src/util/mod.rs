pub mod address;
pub mod constants;
pub mod conversions;
pub mod logger;
pub mod memory;
pub mod numa;
pub mod options;
pub mod test_util;

pub use self::address::Address;
pub use self::address::GlobalPtr;
