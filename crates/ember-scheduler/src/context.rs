//! Execution context carried from the submitting thread into a job.
//!
//! A [`JobContext`] is an immutable snapshot taken when work is submitted.
//! The worker enters it right before the payload runs and the returned
//! [`ContextGuard`] restores whatever was installed before once it is dropped,
//! so pool threads never keep context from an unrelated job. Payloads read it
//! with [`JobContext::current`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

thread_local! {
    static CURRENT: RefCell<Option<JobContext>> = const { RefCell::new(None) };
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobContext {
    values: Arc<BTreeMap<String, String>>,
}

impl JobContext {
    pub fn builder() -> JobContextBuilder {
        JobContextBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Context installed on this thread, if any.
    pub fn current() -> Option<JobContext> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Install this context on the current thread until the guard drops.
    pub fn enter(&self) -> ContextGuard {
        let previous = CURRENT.with(|c| c.replace(Some(self.clone())));
        ContextGuard { previous }
    }
}

#[derive(Debug, Default)]
pub struct JobContextBuilder {
    values: BTreeMap<String, String>,
}

impl JobContextBuilder {
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> JobContext {
        JobContext {
            values: Arc::new(self.values),
        }
    }
}

/// Restores the previously installed context on drop.
#[must_use = "the context is released as soon as the guard is dropped"]
pub struct ContextGuard {
    previous: Option<JobContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|c| *c.borrow_mut() = previous);
    }
}
