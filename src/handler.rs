//! # Event Handlers
//!
//! User handlers are plain async functions taking a typed payload, optionally
//! preceded by the event name. [`payload_only`] and [`with_event_name`] pick
//! the calling convention once at registration and erase it behind a uniform
//! `Arc<dyn EventHandler>`.
//!
//! ```rust,no_run
//! use papa_events::handler::{self, EmittedEvent, HandlerError};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct UserCreated {
//!     id: u64,
//!     email: String,
//! }
//!
//! let send_welcome_email = handler::payload_only(|user: UserCreated| async move {
//!     println!("welcome {}", user.email);
//!     Ok::<_, HandlerError>(vec![EmittedEvent::new(
//!         "email.sent",
//!         &serde_json::json!({ "user_id": user.id }),
//!     )])
//! });
//! ```

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PapaError, PapaResult};

/// Future returned by a started handler invocation
pub type HandlerFuture = BoxFuture<'static, Result<HandlerOutcome, HandlerError>>;

/// A registered handler with its calling convention erased
pub trait EventHandler: Send + Sync + 'static {
    /// Decode `payload` and start the handler.
    ///
    /// Decoding failures are returned as [`PapaError::Validation`] before any
    /// user code runs.
    fn invoke(&self, event_name: &str, payload: &[u8]) -> PapaResult<HandlerFuture>;

    /// Name of the payload type the handler expects
    fn schema_ref(&self) -> &str;
}

/// An event a handler asks to publish after its delivery is acked
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    name: String,
    payload: Result<serde_json::Value, String>,
}

impl EmittedEvent {
    /// Serialization errors are kept and reported when the descriptor is
    /// validated, so a handler never fails just by building one.
    pub fn new<P: Serialize + ?Sized>(name: impl Into<String>, payload: &P) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::to_value(payload).map_err(|e| e.to_string()),
        }
    }

    pub fn from_value(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload: Ok(payload),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialized body, or why the descriptor cannot be published
    pub fn validate(&self) -> Result<Vec<u8>, String> {
        if self.name.is_empty() {
            return Err("emitted event name must not be empty".to_string());
        }
        match &self.payload {
            Err(e) => Err(format!("payload is not JSONable: {e}")),
            Ok(value @ serde_json::Value::Object(_)) => {
                serde_json::to_vec(value).map_err(|e| format!("payload is not JSONable: {e}"))
            }
            Ok(_) => Err("payload must be jsonable object".to_string()),
        }
    }
}

/// Successful handler result
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    pub emitted: Vec<EmittedEvent>,
}

impl HandlerOutcome {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn emit(events: Vec<EmittedEvent>) -> Self {
        Self { emitted: events }
    }
}

/// Handler return values accepted by the adapters
pub trait IntoOutcome {
    fn into_outcome(self) -> HandlerOutcome;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> HandlerOutcome {
        HandlerOutcome::done()
    }
}

impl IntoOutcome for HandlerOutcome {
    fn into_outcome(self) -> HandlerOutcome {
        self
    }
}

impl IntoOutcome for EmittedEvent {
    fn into_outcome(self) -> HandlerOutcome {
        HandlerOutcome::emit(vec![self])
    }
}

impl IntoOutcome for Vec<EmittedEvent> {
    fn into_outcome(self) -> HandlerOutcome {
        HandlerOutcome::emit(self)
    }
}

impl IntoOutcome for Option<Vec<EmittedEvent>> {
    fn into_outcome(self) -> HandlerOutcome {
        HandlerOutcome::emit(self.unwrap_or_default())
    }
}

/// Failure raised by user code.
///
/// Any `std::error::Error` converts with `?`. Errors are retryable unless
/// built with [`HandlerError::permanent`].
pub struct HandlerError {
    source: anyhow::Error,
    retryable: bool,
}

impl HandlerError {
    pub fn new<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            source: anyhow::Error::msg(message),
            retryable: true,
        }
    }

    /// A failure that dead-letters immediately instead of retrying
    pub fn permanent<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self {
            source: anyhow::Error::msg(message),
            retryable: false,
        }
    }

    pub fn from_anyhow(source: anyhow::Error) -> Self {
        Self {
            source,
            retryable: true,
        }
    }

    pub fn into_permanent(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Message including the cause chain
    pub fn message(&self) -> String {
        format!("{:#}", self.source)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self {
            source: anyhow::Error::new(error),
            retryable: true,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.source)
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerError")
            .field("source", &self.source)
            .field("retryable", &self.retryable)
            .finish()
    }
}

fn decode<T: DeserializeOwned>(schema_ref: &str, payload: &[u8]) -> PapaResult<T> {
    serde_json::from_slice(payload).map_err(|e| PapaError::validation(schema_ref, e.to_string()))
}

struct PayloadOnly<T, F> {
    func: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F, Fut, R> EventHandler for PayloadOnly<T, F>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: IntoOutcome + 'static,
{
    fn invoke(&self, _event_name: &str, payload: &[u8]) -> PapaResult<HandlerFuture> {
        let value = decode::<T>(self.schema_ref(), payload)?;
        let fut = (self.func)(value);
        Ok(Box::pin(async move { fut.await.map(IntoOutcome::into_outcome) }))
    }

    fn schema_ref(&self) -> &str {
        type_name::<T>()
    }
}

struct WithEventName<T, F> {
    func: F,
    _payload: PhantomData<fn() -> T>,
}

impl<T, F, Fut, R> EventHandler for WithEventName<T, F>
where
    T: DeserializeOwned + 'static,
    F: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: IntoOutcome + 'static,
{
    fn invoke(&self, event_name: &str, payload: &[u8]) -> PapaResult<HandlerFuture> {
        let value = decode::<T>(self.schema_ref(), payload)?;
        let fut = (self.func)(event_name.to_string(), value);
        Ok(Box::pin(async move { fut.await.map(IntoOutcome::into_outcome) }))
    }

    fn schema_ref(&self) -> &str {
        type_name::<T>()
    }
}

/// Adapt `async fn(payload) -> Result<R, HandlerError>`
pub fn payload_only<T, F, Fut, R>(func: F) -> Arc<dyn EventHandler>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: IntoOutcome + 'static,
{
    Arc::new(PayloadOnly {
        func,
        _payload: PhantomData,
    })
}

/// Adapt `async fn(event_name, payload) -> Result<R, HandlerError>`
pub fn with_event_name<T, F, Fut, R>(func: F) -> Arc<dyn EventHandler>
where
    T: DeserializeOwned + 'static,
    F: Fn(String, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    R: IntoOutcome + 'static,
{
    Arc::new(WithEventName {
        func,
        _payload: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct UserCreated {
        id: u64,
    }

    #[tokio::test]
    async fn test_payload_only_decodes_and_runs() {
        let handler = payload_only(|user: UserCreated| async move {
            Ok::<_, HandlerError>(vec![EmittedEvent::new(
                "email.sent",
                &serde_json::json!({ "user_id": user.id }),
            )])
        });

        let outcome = handler
            .invoke("user.created", br#"{"id": 7}"#)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.emitted.len(), 1);
        assert_eq!(outcome.emitted[0].name(), "email.sent");
        assert!(handler.schema_ref().ends_with("UserCreated"));
    }

    #[tokio::test]
    async fn test_with_event_name_receives_name() {
        let handler = with_event_name(|name: String, _user: UserCreated| async move {
            if name == "user.created" {
                Ok(())
            } else {
                Err(HandlerError::new(format!("unexpected event {name}")))
            }
        });

        assert!(handler
            .invoke("user.created", br#"{"id": 1}"#)
            .unwrap()
            .await
            .is_ok());
        assert!(handler
            .invoke("user.deleted", br#"{"id": 1}"#)
            .unwrap()
            .await
            .is_err());
    }

    #[test]
    fn test_decode_failure_is_validation_error() {
        let handler = payload_only(|_user: UserCreated| async { Ok::<_, HandlerError>(()) });
        let result = handler.invoke("user.created", br#"{"id": "seven"}"#);
        assert!(matches!(result, Err(PapaError::Validation { .. })));
    }

    #[test]
    fn test_emitted_event_validation() {
        assert!(EmittedEvent::new("a.b", &serde_json::json!({"k": 1}))
            .validate()
            .is_ok());
        assert_eq!(
            EmittedEvent::new("a.b", &vec![1, 2]).validate().unwrap_err(),
            "payload must be jsonable object"
        );
        assert!(EmittedEvent::new("", &serde_json::json!({}))
            .validate()
            .is_err());

        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], 1);
        assert!(EmittedEvent::new("a.b", &map)
            .validate()
            .unwrap_err()
            .starts_with("payload is not JSONable"));
    }

    #[test]
    fn test_handler_error_conversions() {
        fn fails() -> Result<(), HandlerError> {
            let _: u32 = "nope".parse()?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(err.is_retryable());
        assert!(!HandlerError::permanent("bad data").is_retryable());
        assert!(!HandlerError::new("x").into_permanent().is_retryable());
        assert!(HandlerError::from_anyhow(anyhow::anyhow!("ctx")).message().contains("ctx"));
    }
}
