//! Backing stores: an in-memory store for tests and ephemeral runs, and a
//! DuckDB store (feature `duckdb`) for persistent deployments.

mod error;
pub use error::StoreError;

mod memory;
pub use memory::MemoryStore;

#[cfg(feature = "duckdb")]
mod duck;
#[cfg(feature = "duckdb")]
pub use duck::DuckStore;
