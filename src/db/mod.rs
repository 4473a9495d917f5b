//! Database module.
//!
//! Provides SQLite storage for targets and their execution history.

mod models;
mod store;

pub use models::*;
pub use store::*;
