//! Data models for the legacy client data import.
//!
//! `import` holds the durable last-attempt record and the closed set of
//! importer outcomes; `summary` holds the read-side response shapes.

pub mod import;
pub mod summary;
