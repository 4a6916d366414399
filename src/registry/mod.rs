//! # Use-Case Registry
//!
//! In-memory lookup of use-case bindings: event-name patterns mapped to a
//! handler and its retry budget. Populated before start, then frozen behind
//! an `Arc` and only read by the dispatch path.
//!
//! Bindings are kept ordered by name so every lookup is deterministic.

pub mod pattern;
pub mod use_case;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{PapaError, PapaResult};
use crate::handler::EventHandler;
use crate::topology::{DLQ_SUFFIX, RETRY_SUFFIX};

pub use pattern::{topic_matches, EventPattern};
pub use use_case::{UseCase, UseCaseBinding};

#[derive(Debug, Default)]
pub struct UseCaseRegistry {
    bindings: BTreeMap<String, Arc<UseCaseBinding>>,
}

impl UseCaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a use case under a unique name
    pub fn register<I, S>(
        &mut self,
        use_case_name: &str,
        patterns: I,
        handler: Arc<dyn EventHandler>,
        max_retries: u32,
    ) -> PapaResult<Arc<UseCaseBinding>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.bindings.contains_key(use_case_name) {
            return Err(PapaError::duplicate_use_case(use_case_name));
        }
        self.validate_name(use_case_name)?;

        let mut parsed: Vec<EventPattern> = Vec::new();
        for pattern in patterns {
            let pattern = EventPattern::parse(pattern.as_ref())?;
            if !parsed.contains(&pattern) {
                parsed.push(pattern);
            }
        }
        if parsed.is_empty() {
            return Err(PapaError::invalid_use_case(
                use_case_name,
                "at least one event pattern is required",
            ));
        }

        let binding = Arc::new(UseCaseBinding {
            name: use_case_name.to_string(),
            patterns: parsed,
            handler,
            max_retries,
        });
        debug!(
            use_case = %use_case_name,
            patterns = ?binding.patterns.iter().map(EventPattern::as_str).collect::<Vec<_>>(),
            max_retries = max_retries,
            schema_ref = %binding.schema_ref(),
            "📝 Use case registered"
        );
        self.bindings
            .insert(use_case_name.to_string(), Arc::clone(&binding));
        Ok(binding)
    }

    /// Register from a [`UseCase`] builder, falling back to `default_retries`
    pub fn register_use_case(
        &mut self,
        use_case: UseCase,
        default_retries: u32,
    ) -> PapaResult<Arc<UseCaseBinding>> {
        let retries = use_case.retries.unwrap_or(default_retries);
        self.register(&use_case.name, &use_case.patterns, use_case.handler, retries)
    }

    /// Every binding whose patterns match `event_name`, ordered by name
    pub fn match_event(&self, event_name: &str) -> Vec<Arc<UseCaseBinding>> {
        self.bindings
            .values()
            .filter(|binding| binding.matches(event_name))
            .cloned()
            .collect()
    }

    pub fn get(&self, use_case_name: &str) -> Option<Arc<UseCaseBinding>> {
        self.bindings.get(use_case_name).cloned()
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Arc<UseCaseBinding>> {
        self.bindings.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Queue names derive from use-case names, so a name may not equal
    /// another use case's retry or dead-letter queue.
    fn validate_name(&self, name: &str) -> PapaResult<()> {
        if name.trim().is_empty() {
            return Err(PapaError::invalid_use_case(name, "name must not be empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(PapaError::invalid_use_case(
                name,
                "name must not contain whitespace",
            ));
        }
        for existing in self.bindings.keys() {
            for suffix in [RETRY_SUFFIX, DLQ_SUFFIX] {
                if name == format!("{existing}{suffix}") || *existing == format!("{name}{suffix}")
                {
                    return Err(PapaError::invalid_use_case(
                        name,
                        format!("queue names collide with use case <{existing}>"),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{self, HandlerError};

    fn noop() -> Arc<dyn EventHandler> {
        handler::payload_only(|_: serde_json::Value| async { Ok::<_, HandlerError>(()) })
    }

    #[test]
    fn test_register_and_match() {
        let mut registry = UseCaseRegistry::new();
        registry
            .register("welcome", ["user.created"], noop(), 5)
            .unwrap();
        registry
            .register("audit", ["user.*", "order.#"], noop(), 2)
            .unwrap();

        let matched: Vec<String> = registry
            .match_event("user.created")
            .iter()
            .map(|b| b.name.clone())
            .collect();
        assert_eq!(matched, vec!["audit".to_string(), "welcome".to_string()]);
        assert_eq!(registry.match_event("order.placed.eu").len(), 1);
        assert!(registry.match_event("invoice.paid").is_empty());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = UseCaseRegistry::new();
        registry.register("welcome", ["user.created"], noop(), 5).unwrap();
        let err = registry
            .register("welcome", ["user.updated"], noop(), 5)
            .unwrap_err();
        assert!(matches!(err, PapaError::DuplicateUseCase { .. }));
        assert!(err.to_string().contains("Duplicate functions for"));
    }

    #[test]
    fn test_derived_queue_name_collisions_rejected() {
        let mut registry = UseCaseRegistry::new();
        registry.register("orders", ["order.*"], noop(), 5).unwrap();
        assert!(matches!(
            registry.register("orders.retry", ["x"], noop(), 5),
            Err(PapaError::InvalidUseCase { .. })
        ));

        let mut registry = UseCaseRegistry::new();
        registry.register("orders.dlq", ["x"], noop(), 5).unwrap();
        assert!(registry.register("orders", ["order.*"], noop(), 5).is_err());
    }

    #[test]
    fn test_empty_and_invalid_patterns_rejected() {
        let mut registry = UseCaseRegistry::new();
        assert!(matches!(
            registry.register("a", Vec::<String>::new(), noop(), 5),
            Err(PapaError::InvalidUseCase { .. })
        ));
        assert!(matches!(
            registry.register("b", ["user..created"], noop(), 5),
            Err(PapaError::InvalidPattern { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_builder_retries_default() {
        let mut registry = UseCaseRegistry::new();
        let binding = registry
            .register_use_case(UseCase::new("a", ["x.y"], noop()), 5)
            .unwrap();
        assert_eq!(binding.max_retries, 5);

        let binding = registry
            .register_use_case(UseCase::new("b", ["x.y"], noop()).retries(1), 5)
            .unwrap();
        assert_eq!(binding.max_retries, 1);
    }
}
