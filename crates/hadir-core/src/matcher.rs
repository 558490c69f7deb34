//! Nearest-neighbour identity matching under a Euclidean distance threshold.
//!
//! A linear scan per query. Enrolled populations are tens to low hundreds of
//! people and queries arrive at tick rate, so no index is kept.

use std::fmt;

use serde::Serialize;

use crate::types::{Descriptor, EnrolledIdentity};

/// Default maximum Euclidean distance for a positive match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Outcome of a recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Label of the matched identity, `None` when unknown.
    pub label: Option<String>,
    /// Distance to the nearest enrolled descriptor (`+inf` if none enrolled).
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            label: None,
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.label.is_some()
    }
}

impl fmt::Display for MatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.label.as_deref().unwrap_or("unknown");
        write!(f, "{label} ({:.3})", self.distance)
    }
}

#[derive(Debug, Clone)]
pub struct IdentityMatcher {
    threshold: f32,
    identities: Vec<EnrolledIdentity>,
}

impl IdentityMatcher {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            identities: Vec::new(),
        }
    }

    /// Replace the enrolled set. Enrollment order is kept for tie-breaking.
    pub fn load(&mut self, identities: Vec<EnrolledIdentity>) {
        self.identities = identities;
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Find the nearest enrolled identity; `unknown` if it is farther than the threshold.
    pub fn recognize(&self, descriptor: &Descriptor) -> MatchResult {
        match self.nearest(descriptor) {
            Some((identity, distance)) if distance <= self.threshold => MatchResult {
                label: Some(identity.label.clone()),
                distance,
            },
            Some((_, distance)) => MatchResult::unknown(distance),
            None => MatchResult::unknown(f32::INFINITY),
        }
    }

    /// Look up an enrolled identity by label.
    pub fn identity(&self, label: &str) -> Option<&EnrolledIdentity> {
        self.identities.iter().find(|i| i.label == label)
    }

    fn nearest(&self, descriptor: &Descriptor) -> Option<(&EnrolledIdentity, f32)> {
        let mut best: Option<(&EnrolledIdentity, f32)> = None;
        for identity in &self.identities {
            let distance = descriptor.distance(&identity.descriptor);
            // Strict comparison: the earliest enrolled wins a tie
            let is_better = match best {
                None => true,
                Some((_, d)) => distance < d,
            };
            if is_better {
                best = Some((identity, distance));
            }
        }
        best
    }
}

impl Default for IdentityMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DESCRIPTOR_DIM;

    /// Helper: descriptor with the given leading values, zeros elsewhere.
    fn desc(head: &[f32]) -> Descriptor {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[..head.len()].copy_from_slice(head);
        Descriptor::new(values).unwrap()
    }

    fn identity(label: &str, head: &[f32]) -> EnrolledIdentity {
        EnrolledIdentity {
            label: label.to_string(),
            name: format!("{label} name"),
            descriptor: desc(head),
        }
    }

    #[test]
    fn test_empty_set_is_unknown_at_infinity() {
        let matcher = IdentityMatcher::default();
        let result = matcher.recognize(&desc(&[0.1]));
        assert!(!result.is_known());
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_self_match_is_zero() {
        let mut matcher = IdentityMatcher::default();
        let a = identity("A", &[0.3, -0.2, 0.9]);
        matcher.load(vec![a.clone()]);
        let result = matcher.recognize(&a.descriptor);
        assert_eq!(result.label.as_deref(), Some("A"));
        assert_eq!(result.distance, 0.0);
    }

    #[test]
    fn test_beyond_threshold_is_unknown_with_distance() {
        let mut matcher = IdentityMatcher::new(0.6);
        matcher.load(vec![identity("A", &[0.0])]);
        let result = matcher.recognize(&desc(&[0.8]));
        assert!(!result.is_known());
        assert!((result.distance - 0.8).abs() < 1e-6);
        assert_eq!(result.to_string(), "unknown (0.800)");
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let mut matcher = IdentityMatcher::new(0.5);
        matcher.load(vec![identity("A", &[0.0])]);
        assert!(matcher.recognize(&desc(&[0.5])).is_known());
    }

    #[test]
    fn test_nearest_wins() {
        let mut matcher = IdentityMatcher::default();
        matcher.load(vec![
            identity("far", &[0.5]),
            identity("near", &[0.1]),
            identity("other", &[-0.4]),
        ]);
        let result = matcher.recognize(&desc(&[0.15]));
        assert_eq!(result.label.as_deref(), Some("near"));
    }

    #[test]
    fn test_tie_goes_to_first_enrolled() {
        let mut matcher = IdentityMatcher::default();
        matcher.load(vec![identity("first", &[0.2]), identity("second", &[-0.2])]);
        for _ in 0..10 {
            let result = matcher.recognize(&desc(&[0.0]));
            assert_eq!(result.label.as_deref(), Some("first"));
        }
    }

    #[test]
    fn test_load_replaces_set() {
        let mut matcher = IdentityMatcher::default();
        matcher.load(vec![identity("A", &[0.0])]);
        matcher.load(vec![identity("B", &[0.0])]);
        assert_eq!(matcher.len(), 1);
        assert!(matcher.identity("A").is_none());
        assert_eq!(
            matcher.recognize(&desc(&[0.0])).label.as_deref(),
            Some("B")
        );
    }
}
