//! Persistence layer — libSQL-backed async storage for the sentinel core.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    ConfirmedCheckIn, ExpiredCheckIn, MissOutcome, ReleaseOutcome, Store,
};
