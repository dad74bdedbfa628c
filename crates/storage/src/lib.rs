//! Persistence for task models and their execution history.
//!
//! [`TaskStore`] is the seam the optimizer talks to. [`MemoryStore`] backs
//! tests and the simulator; [`PgTaskStore`] is the PostgreSQL implementation
//! with the `task_models` / `execution_history` schema under `migrations/`.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgTaskStore;
pub use traits::TaskStore;
