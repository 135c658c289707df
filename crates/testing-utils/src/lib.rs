//! # Mediaflow Testing Utils
//!
//! Shared testing utilities for the mediaflow workspace: in-memory mocks
//! of the repository and broker ports, entity builders, a RabbitMQ test
//! container and small async helpers.
//!
//! ```toml
//! [dev-dependencies]
//! mediaflow-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod containers;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use containers::*;
pub use helpers::*;
pub use mocks::*;
