//! # Messaging Types
//!
//! Provider-agnostic declarations and message shapes exchanged with the broker.

use std::collections::HashMap;
use std::time::Duration;

/// Message headers. String-valued so they double as a trace-context carrier.
pub type Headers = HashMap<String, String>;

/// Exchange routing semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routing key matched against dot-separated binding patterns
    Topic,
    /// Routing key matched exactly
    Direct,
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
        }
    }
}

/// Queue declaration
///
/// `dead_letter_exchange` of `Some("")` targets the default exchange, which
/// routes by queue name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub quorum: bool,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    /// Queue-wide message time-to-live (`x-message-ttl`)
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            quorum: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            message_ttl: None,
        }
    }

    /// Expired or rejected messages are re-routed through `exchange` with `routing_key`
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    /// Every message expires `ttl` after it was enqueued. Brokers only expire
    /// messages at the head of a queue, so a uniform TTL keeps expiry in order.
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// A message on its way to an exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub message_id: Option<String>,
    /// Per-message time-to-live. Only honoured once the message reaches the
    /// head of its queue.
    pub expiration: Option<Duration>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
            message_id: None,
            expiration: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }
}

/// Handle for acknowledging a received message (the delivery tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub u64);

impl ReceiptHandle {
    pub fn delivery_tag(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from a queue
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub receipt: ReceiptHandle,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub message_id: Option<String>,
    pub redelivered: bool,
}

impl Delivery {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}
