//! Lazily rendered step names.
//!
//! Resolution walkers label every batched fetch with a human readable step
//! name (usually `Type.field`). Building the label can be expensive, so the
//! walker hands over a factory and the label is only rendered when a scope is
//! actually opened or an error needs it.

use std::fmt;
use std::sync::Arc;

/// A lazily evaluated step label.
#[derive(Clone)]
pub struct StepName {
    factory: Arc<dyn Fn() -> String + Send + Sync>,
}

impl StepName {
    /// Creates a step name from a factory. The factory runs on every render.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Creates a step name from a fixed label.
    pub fn fixed(label: impl Into<String>) -> Self {
        let label: Arc<str> = Arc::from(label.into());
        Self::new(move || label.to_string())
    }

    /// Renders the label.
    #[must_use]
    pub fn render(&self) -> String {
        (self.factory)()
    }
}

impl fmt::Debug for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Rendering here would defeat the laziness.
        f.write_str("StepName(..)")
    }
}

impl From<&'static str> for StepName {
    fn from(label: &'static str) -> Self {
        Self::new(move || label.to_string())
    }
}

impl From<String> for StepName {
    fn from(label: String) -> Self {
        Self::fixed(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_factory_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let step = StepName::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "User.posts".to_string()
        });

        let cloned = step.clone();
        let _ = format!("{cloned:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(step.render(), "User.posts");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_str() {
        let step: StepName = "Query.users".into();
        assert_eq!(step.render(), "Query.users");
    }
}
