//! # Event Patterns
//!
//! Dot-separated event-name patterns with topic-exchange semantics:
//! `*` matches exactly one segment, `#` matches zero or more. Matching is
//! case-sensitive. The pattern text doubles as the broker binding key.

use std::fmt;
use std::str::FromStr;

use crate::error::{PapaError, PapaResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    One,
    Many,
}

impl Segment {
    fn lenient(token: &str) -> Self {
        match token {
            "*" => Segment::One,
            "#" => Segment::Many,
            other => Segment::Literal(other.to_string()),
        }
    }
}

/// A validated event-name pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl EventPattern {
    pub fn parse(pattern: &str) -> PapaResult<Self> {
        if pattern.is_empty() {
            return Err(PapaError::invalid_pattern(pattern, "pattern is empty"));
        }

        let mut segments = Vec::new();
        for token in pattern.split('.') {
            if token.is_empty() {
                return Err(PapaError::invalid_pattern(pattern, "empty segment"));
            }
            if token.chars().any(char::is_whitespace) {
                return Err(PapaError::invalid_pattern(
                    pattern,
                    format!("segment '{token}' contains whitespace"),
                ));
            }
            if token.len() > 1 && token.contains(['*', '#']) {
                return Err(PapaError::invalid_pattern(
                    pattern,
                    format!("wildcard must occupy a whole segment, found '{token}'"),
                ));
            }
            segments.push(Segment::lenient(token));
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Binding key for the topic exchange
    pub fn routing_key(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    pub fn matches(&self, event_name: &str) -> bool {
        let words: Vec<&str> = event_name.split('.').collect();
        match_segments(&self.segments, &words)
    }
}

impl FromStr for EventPattern {
    type Err = PapaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn match_segments(pattern: &[Segment], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((Segment::Many, rest)) => {
            (0..=words.len()).any(|skip| match_segments(rest, &words[skip..]))
        }
        Some((Segment::One, rest)) => !words.is_empty() && match_segments(rest, &words[1..]),
        Some((Segment::Literal(literal), rest)) => {
            words.first() == Some(&literal.as_str()) && match_segments(rest, &words[1..])
        }
    }
}

/// Topic-exchange match of a raw binding key against a routing key.
///
/// Unlike [`EventPattern::parse`] this never fails; malformed keys simply
/// match literally, the way a broker treats them.
pub fn topic_matches(binding_key: &str, routing_key: &str) -> bool {
    let segments: Vec<Segment> = binding_key.split('.').map(Segment::lenient).collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_segments(&segments, &words)
}
