#![feature(io_error_more)]
mod addr;
mod duplex;
mod fixed_read;
#[cfg(any(test, feature = "test-util"))]
mod memio;

pub use addr::*;
pub use duplex::*;
pub use fixed_read::*;
#[cfg(any(test, feature = "test-util"))]
pub use memio::*;
