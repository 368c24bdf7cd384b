//! Core data models for the file-share service.
//!
//! These map to the SQLite tables via `sqlx::FromRow` and serialize as JSON
//! via `serde` (camelCase, matching the web client).

pub mod resource;
pub mod share;
pub mod user;
