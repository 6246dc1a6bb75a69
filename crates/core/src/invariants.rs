//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use std::collections::BTreeSet;

use crate::endpoint::EndpointId;

/// Validate that a meeting point's membership is internally consistent
pub fn assert_meeting_invariants(
    local_id: &EndpointId,
    peer_set: &BTreeSet<EndpointId>,
    joined: &BTreeSet<EndpointId>,
) {
    debug_assert!(
        !peer_set.contains(local_id),
        "Meeting point {} expects itself",
        local_id
    );

    debug_assert!(
        joined.is_subset(peer_set),
        "Meeting point {} has joined peers {:?} outside its peer set {:?}",
        local_id,
        joined,
        peer_set
    );
}

/// Validate that a logical clock never moves backwards
pub fn assert_clock_monotonic(previous: u64, next: u64, context: &str) {
    debug_assert!(
        next >= previous,
        "Clock went backwards from {} to {} in {}",
        previous,
        next,
        context
    );
}

/// Validate that an id is usable as a peer identity
pub fn assert_endpoint_id_valid(id: &EndpointId, context: &str) {
    debug_assert!(
        !id.as_str().is_empty(),
        "Empty endpoint id in context: {}",
        context
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<EndpointId> {
        ids.iter().map(|s| EndpointId::from(*s)).collect()
    }

    #[test]
    fn test_valid_meeting() {
        assert_meeting_invariants(&"a".into(), &set(&["b", "c"]), &set(&["b"]));
    }

    #[test]
    #[should_panic(expected = "expects itself")]
    fn test_meeting_with_self() {
        assert_meeting_invariants(&"a".into(), &set(&["a", "b"]), &set(&[]));
    }

    #[test]
    #[should_panic(expected = "outside its peer set")]
    fn test_joined_not_subset() {
        assert_meeting_invariants(&"a".into(), &set(&["b"]), &set(&["c"]));
    }

    #[test]
    fn test_clock_forward() {
        assert_clock_monotonic(3, 3, "test");
        assert_clock_monotonic(3, 4, "test");
    }

    #[test]
    #[should_panic(expected = "went backwards")]
    fn test_clock_backwards() {
        assert_clock_monotonic(4, 3, "test");
    }

    #[test]
    #[should_panic(expected = "Empty endpoint id")]
    fn test_empty_id() {
        assert_endpoint_id_valid(&"".into(), "test");
    }
}
