use std::sync::{Arc, RwLock};

/// Shared, hot-swappable settings.
///
/// Readers take a cheap clone of the current value on every use, so a value
/// published by the reload task is picked up at the next read without any
/// restart.
#[derive(Debug, Default)]
pub struct LiveTuning<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for LiveTuning<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> LiveTuning<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Current value.
    pub fn get(&self) -> T {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the current value. Returns `true` if it changed.
    pub fn publish(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard == value {
            return false;
        }
        *guard = value;
        true
    }
}
