//! # beacon-store
//!
//! SQLite-backed incident records. The relay core never touches this crate
//! directly; the server reaches it through its storage collaborator trait.

pub mod database;
pub mod error;
pub mod incidents;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use incidents::IncidentRepo;
