//! ClariPhish Storage - campaign recipients, events and directory data
//!
//! Repository traits with a PostgreSQL implementation on `sqlx` and an
//! in-memory implementation sharing the same semantics.

pub mod db;
#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::{Backend, DatabasePool};
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
