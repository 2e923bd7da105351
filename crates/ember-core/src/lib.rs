//! `ember-core` — configuration and shared error types for the ember workspace.

pub mod config;
pub mod error;

pub use config::{AppConfig, EmberConfig, JobsConfig, PlaceholderResolver, Settings};
pub use error::{EmberError, Result};
