//! In-memory collaborators, recording mocks and fixtures for sluice tests.

pub mod fixtures;
pub mod mock;
pub mod storage;

pub use fixtures::*;
pub use mock::*;
pub use storage::*;
