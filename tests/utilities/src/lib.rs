
pub mod mocks;

pub use utilities::{setup_tracing, wait_until, Account, ACCOUNT1, ACCOUNT2};
