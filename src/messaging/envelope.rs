//! # Event Envelope
//!
//! Delivery metadata carried alongside an event payload. On the wire the
//! envelope lives entirely in message headers so the body stays the raw
//! JSON payload that producers sent.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use super::types::{Delivery, Headers, OutboundMessage};

/// Reserved header names
pub mod header_keys {
    pub const EVENT_NAME: &str = "x-event-name";
    pub const MESSAGE_ID: &str = "x-message-id";
    pub const RETRY_COUNT: &str = "x-retry-count";
    pub const FIRST_SEEN_AT: &str = "x-first-seen-at";
    pub const SCHEMA_REF: &str = "x-schema-ref";
    pub const EXCEPTION: &str = "x-exception";
    /// Earliest time a parked retry may run again
    pub const RETRY_NOT_BEFORE: &str = "x-retry-not-before";

    pub(crate) const RESERVED: [&str; 7] = [
        EVENT_NAME,
        MESSAGE_ID,
        RETRY_COUNT,
        FIRST_SEEN_AT,
        SCHEMA_REF,
        EXCEPTION,
        RETRY_NOT_BEFORE,
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub message_id: Uuid,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub content_schema_ref: Option<String>,
    pub retry_count: u32,
    pub trace_context: Headers,
    pub first_seen_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Set while the envelope waits out a retry backoff
    pub retry_not_before: Option<DateTime<Utc>>,
}

impl EventEnvelope {
    pub fn new(event_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            event_name: event_name.into(),
            payload: payload.into(),
            content_schema_ref: None,
            retry_count: 0,
            trace_context: Headers::new(),
            first_seen_at: Utc::now(),
            last_error: None,
            retry_not_before: None,
        }
    }

    pub fn with_schema_ref(mut self, schema_ref: impl Into<String>) -> Self {
        self.content_schema_ref = Some(schema_ref.into());
        self
    }

    pub fn with_trace_context(mut self, trace_context: Headers) -> Self {
        self.trace_context = trace_context;
        self
    }

    /// Rebuild the envelope from a received delivery.
    ///
    /// Messages returning from a retry queue carry the use case name as
    /// routing key, so the event name header wins over the routing key.
    /// Missing or malformed metadata falls back to first-delivery values.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let event_name = delivery
            .header(header_keys::EVENT_NAME)
            .unwrap_or(&delivery.routing_key)
            .to_string();

        let message_id = delivery
            .header(header_keys::MESSAGE_ID)
            .or(delivery.message_id.as_deref())
            .and_then(|id| Uuid::parse_str(id).ok())
            .unwrap_or_else(Uuid::new_v4);

        let retry_count = delivery
            .header(header_keys::RETRY_COUNT)
            .and_then(|count| count.parse::<u32>().ok())
            .unwrap_or(0);

        let first_seen_at = delivery
            .header(header_keys::FIRST_SEEN_AT)
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let trace_context = delivery
            .headers
            .iter()
            .filter(|(key, _)| !header_keys::RESERVED.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            message_id,
            event_name,
            payload: delivery.body.clone(),
            content_schema_ref: delivery.header(header_keys::SCHEMA_REF).map(str::to_string),
            retry_count,
            trace_context,
            first_seen_at,
            last_error: delivery.header(header_keys::EXCEPTION).map(str::to_string),
            retry_not_before: delivery
                .header(header_keys::RETRY_NOT_BEFORE)
                .and_then(parse_timestamp),
        }
    }

    /// Header set for the wire, trace context included
    pub fn headers(&self) -> Headers {
        let mut headers = self.trace_context.clone();
        headers.insert(header_keys::EVENT_NAME.to_string(), self.event_name.clone());
        headers.insert(header_keys::MESSAGE_ID.to_string(), self.message_id.to_string());
        headers.insert(
            header_keys::RETRY_COUNT.to_string(),
            self.retry_count.to_string(),
        );
        headers.insert(
            header_keys::FIRST_SEEN_AT.to_string(),
            self.first_seen_at.to_rfc3339(),
        );
        if let Some(schema_ref) = &self.content_schema_ref {
            headers.insert(header_keys::SCHEMA_REF.to_string(), schema_ref.clone());
        }
        if let Some(error) = &self.last_error {
            headers.insert(header_keys::EXCEPTION.to_string(), error.clone());
        }
        if let Some(not_before) = &self.retry_not_before {
            headers.insert(
                header_keys::RETRY_NOT_BEFORE.to_string(),
                not_before.to_rfc3339_opts(SecondsFormat::Millis, true),
            );
        }
        headers
    }

    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage::new(self.payload.clone())
            .with_headers(self.headers())
            .with_message_id(self.message_id.to_string())
    }

    /// The envelope for the next attempt after a failure, runnable from
    /// `not_before`. Identity and first-seen time are kept so the lifecycle
    /// stays traceable.
    pub fn next_attempt(&self, error: impl Into<String>, not_before: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            last_error: Some(error.into()),
            retry_not_before: Some(not_before),
            ..self.clone()
        }
    }

    /// The envelope as it should rest in a dead-letter queue
    pub fn dead_lettered(&self, reason: impl Into<String>) -> Self {
        Self {
            last_error: Some(reason.into()),
            retry_not_before: None,
            ..self.clone()
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::types::ReceiptHandle;

    fn delivery_from(message: OutboundMessage, routing_key: &str) -> Delivery {
        Delivery {
            receipt: ReceiptHandle(1),
            queue: "orders".to_string(),
            exchange: "domain_events".to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
            headers: message.headers,
            message_id: message.message_id,
            redelivered: false,
        }
    }

    #[test]
    fn test_envelope_survives_the_wire() {
        let mut trace = Headers::new();
        trace.insert("traceparent".to_string(), "00-abc-def-01".to_string());

        let envelope = EventEnvelope::new("order.placed", br#"{"id":1}"#.to_vec())
            .with_schema_ref("OrderPlaced")
            .with_trace_context(trace.clone());
        let received = EventEnvelope::from_delivery(&delivery_from(
            envelope.to_message(),
            "order.placed",
        ));

        assert_eq!(received.message_id, envelope.message_id);
        assert_eq!(received.event_name, "order.placed");
        assert_eq!(received.retry_count, 0);
        assert_eq!(received.content_schema_ref.as_deref(), Some("OrderPlaced"));
        assert_eq!(received.trace_context, trace);
    }

    #[test]
    fn test_event_name_header_wins_over_routing_key() {
        let not_before = Utc::now() + chrono::Duration::seconds(4);
        let envelope =
            EventEnvelope::new("order.placed", b"{}".to_vec()).next_attempt("boom", not_before);
        let received =
            EventEnvelope::from_delivery(&delivery_from(envelope.to_message(), "send_invoice"));

        assert_eq!(received.event_name, "order.placed");
        assert_eq!(received.retry_count, 1);
        assert_eq!(received.last_error.as_deref(), Some("boom"));
        assert_eq!(
            received.retry_not_before.map(|ts| ts.timestamp_millis()),
            Some(not_before.timestamp_millis())
        );
        assert!(received.trace_context.is_empty());

        let dead = received.dead_lettered("MaxRetriesExceeded");
        assert!(!dead.headers().contains_key(header_keys::RETRY_NOT_BEFORE));
    }

    #[test]
    fn test_missing_headers_default_to_first_delivery() {
        let received = EventEnvelope::from_delivery(&delivery_from(
            OutboundMessage::new(b"{}".to_vec()),
            "user.created",
        ));
        assert_eq!(received.event_name, "user.created");
        assert_eq!(received.retry_count, 0);
        assert!(received.trace_context.is_empty());
    }

    #[test]
    fn test_next_attempt_never_decreases() {
        let mut envelope = EventEnvelope::new("a.b", b"{}".to_vec());
        envelope.retry_count = u32::MAX;
        assert_eq!(envelope.next_attempt("x", Utc::now()).retry_count, u32::MAX);
    }
}
