//! Use-case declarations and their registered bindings.

use std::fmt;
use std::sync::Arc;

use super::pattern::EventPattern;
use crate::handler::EventHandler;

/// Builder for a use case, handed to [`crate::EventApp::register_use_case`]
///
/// ```rust,no_run
/// use papa_events::handler::{self, HandlerError};
/// use papa_events::UseCase;
///
/// let use_case = UseCase::new(
///     "send_welcome_email",
///     ["user.created", "user.reactivated"],
///     handler::payload_only(|_payload: serde_json::Value| async { Ok::<_, HandlerError>(()) }),
/// )
/// .retries(3);
/// ```
pub struct UseCase {
    pub(crate) name: String,
    pub(crate) patterns: Vec<String>,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) retries: Option<u32>,
}

impl UseCase {
    pub fn new<I, S>(name: impl Into<String>, patterns: I, handler: Arc<dyn EventHandler>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            patterns: patterns.into_iter().map(Into::into).collect(),
            handler,
            retries: None,
        }
    }

    /// Override the application-wide retry budget
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for UseCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCase")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("schema_ref", &self.handler.schema_ref())
            .field("retries", &self.retries)
            .finish()
    }
}

/// A registered use case. Immutable once created.
pub struct UseCaseBinding {
    pub name: String,
    pub patterns: Vec<EventPattern>,
    pub handler: Arc<dyn EventHandler>,
    pub max_retries: u32,
}

impl UseCaseBinding {
    pub fn matches(&self, event_name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(event_name))
    }

    pub fn schema_ref(&self) -> &str {
        self.handler.schema_ref()
    }
}

impl fmt::Debug for UseCaseBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UseCaseBinding")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("schema_ref", &self.handler.schema_ref())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
