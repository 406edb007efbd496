//! # AgriProv Common Library
//!
//! Shared code for AgriProv services including:
//! - Error type used by the persistence layer
//! - TOML configuration and root folder resolution
//! - Event types (AgpEvent enum) and the EventBus
//! - SQLite schema initialization and lock-retry helper

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
