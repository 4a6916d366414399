use proptest::prelude::*;

/// A single literal routing segment
pub fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,7}"
}

/// Dot-separated event names of one to five segments
pub fn event_name_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(segment_strategy(), 1..=5).prop_map(|segments| segments.join("."))
}

/// An event name together with a pattern derived from it by replacing some
/// segments with `*`, so the pattern always matches the name
pub fn matching_star_pattern_strategy() -> impl Strategy<Value = (String, String)> {
    prop::collection::vec((segment_strategy(), any::<bool>()), 1..=5).prop_map(|parts| {
        let name = parts
            .iter()
            .map(|(segment, _)| segment.as_str())
            .collect::<Vec<_>>()
            .join(".");
        let pattern = parts
            .iter()
            .map(|(segment, wild)| if *wild { "*" } else { segment.as_str() })
            .collect::<Vec<_>>()
            .join(".");
        (name, pattern)
    })
}

/// Patterns mixing literals, `*` and `#`
pub fn pattern_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            4 => segment_strategy(),
            2 => Just("*".to_string()),
            1 => Just("#".to_string()),
        ],
        1..=4,
    )
    .prop_map(|segments| segments.join("."))
}

/// Backoff parameters as (base_ms, multiplier, max_ms)
pub fn backoff_strategy() -> impl Strategy<Value = (u64, f64, u64)> {
    (1u64..5_000, 1.1f64..4.0, 1u64..600_000)
}
