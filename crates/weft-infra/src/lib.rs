//! Infrastructure layer for Weft.
//!
//! Implements the repository traits from `weft-core` with concrete storage:
//! SQLite via sqlx with split read/write pools.

pub mod sqlite;
