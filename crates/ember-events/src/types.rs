use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EventError, Result};

/// Phase transitions an application goes through during one run.
///
/// Variants are declared in dispatch order; a host emits each of them at
/// most once per run (a reload builds a fresh bus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppEvent {
    /// Database services are wired up.
    DbServiceLoaded,
    /// About to build the application class loader.
    PreLoadClasses,
    ClassLoaderInitialized,
    /// All application classes have been preloaded.
    ClassLoaded,
    /// Source/bytecode scanners have finished.
    AppCodeScanned,
    PreStart,
    Start,
    Stop,
}

impl AppEvent {
    pub const COUNT: usize = 8;

    /// Every event, in dispatch order. `ALL[e.index()] == e`.
    pub const ALL: [AppEvent; AppEvent::COUNT] = [
        AppEvent::DbServiceLoaded,
        AppEvent::PreLoadClasses,
        AppEvent::ClassLoaderInitialized,
        AppEvent::ClassLoaded,
        AppEvent::AppCodeScanned,
        AppEvent::PreStart,
        AppEvent::Start,
        AppEvent::Stop,
    ];

    /// Position in [`AppEvent::ALL`]; usable as a table index.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppEvent::DbServiceLoaded => "db_service_loaded",
            AppEvent::PreLoadClasses => "pre_load_classes",
            AppEvent::ClassLoaderInitialized => "class_loader_initialized",
            AppEvent::ClassLoaded => "class_loaded",
            AppEvent::AppCodeScanned => "app_code_scanned",
            AppEvent::PreStart => "pre_start",
            AppEvent::Start => "start",
            AppEvent::Stop => "stop",
        }
    }
}

impl fmt::Display for AppEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppEvent {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self> {
        AppEvent::ALL
            .into_iter()
            .find(|e| e.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EventError::UnknownEvent(s.to_string()))
    }
}

/// Synchronous event listener.
///
/// Listeners run on the emitting thread, so anything slow should be handed
/// off (the job scheduler does exactly that for non-precedence work).
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: AppEvent) -> Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(AppEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: AppEvent) -> Result<()> {
        self(event)
    }
}

/// A registered listener bound to one event.
pub(crate) struct Binding {
    /// Used for log correlation only; names need not be unique.
    pub name: String,
    pub event: AppEvent,
    pub listener: Arc<dyn EventListener>,
}
