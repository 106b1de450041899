//! Core types shared by every Hearth crate: the configuration tree, the
//! canonical HTTP error sum, the user/account model, and the route pattern
//! compiler.

pub mod config;
pub mod error;
pub mod pattern;
pub mod user;

pub use error::HttpError;

/// Group name that unconditionally passes every authorization check.
pub const ADMIN_GROUP: &str = "admin";
