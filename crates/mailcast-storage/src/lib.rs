//! Mailcast Storage - Persistence for campaigns, email jobs and notifications
//!
//! Every repository comes in two flavours: a PostgreSQL implementation used
//! in production and an in-memory one used when no database is configured
//! and throughout the test suites.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
