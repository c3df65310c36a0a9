//! Tradeguard Core Library
//!
//! Shared domain types, error taxonomy, and configuration for the trading
//! risk control engine.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
