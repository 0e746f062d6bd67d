//! Test doubles for the failover engine.
//!
//! Compiled for this crate's own tests and, behind the `test-utilities`
//! feature, for downstream crates.

mod fake_node;
mod mock_coordinator;

pub use fake_node::{FakeNode, FakeRole};
pub use mock_coordinator::MockCoordinator;
