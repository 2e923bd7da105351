//! `ember-events` — application lifecycle events and the bus that dispatches them.
//!
//! The host drives the lifecycle by calling [`EventBus::emit`] once per phase,
//! in [`AppEvent::ALL`] order. Subscribers (the job scheduler among them) bind
//! listeners at construction time and are invoked synchronously on the
//! emitting thread.

pub mod bus;
pub mod error;
pub mod types;

pub use bus::EventBus;
pub use error::{EventError, Result};
pub use types::{AppEvent, EventListener};
