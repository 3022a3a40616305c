pub mod chain;
pub mod errors;
pub mod hash;
pub mod journal;
pub mod log;
pub mod search;
pub mod store;
pub mod transaction;
pub mod types;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
