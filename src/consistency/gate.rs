// File: src/consistency/gate.rs

use std::fmt;

/// When revisions above the contiguous frontier reach the projections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectionPolicy {
    /// Hold revisions above a gap in the log; replay them in seq order once
    /// the gap closes. Projections never show state past a hole.
    #[default]
    Deferred,

    /// Project every revision immediately, guarded only by watermarks
    Optimistic,
}

impl ProjectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionPolicy::Deferred => "deferred",
            ProjectionPolicy::Optimistic => "optimistic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deferred" => Some(ProjectionPolicy::Deferred),
            "optimistic" => Some(ProjectionPolicy::Optimistic),
            _ => None,
        }
    }
}

impl fmt::Display for ProjectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Watermark decision for a single projection row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Incoming seq is at or above the row's watermark
    Apply,
    /// Row already reflects a newer revision
    Stale,
}

/// `seq >= watermark` guard shared by every projection write.
///
/// Equal seqs apply so that several writes from the same revision (leaf
/// hash, owner, payload) all land.
pub fn admit(incoming_seq: u64, watermark: Option<u64>) -> Admission {
    match watermark {
        Some(current) if incoming_seq < current => Admission::Stale,
        _ => Admission::Apply,
    }
}

/// Projection release policy for one replica
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyGate {
    policy: ProjectionPolicy,
}

impl ConsistencyGate {
    pub fn new(policy: ProjectionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ProjectionPolicy {
        self.policy
    }

    /// Whether a revision at `seq` may be projected right away given the
    /// tree's contiguous frontier before the revision was logged
    pub fn releases(&self, seq: u64, frontier: u64) -> bool {
        match self.policy {
            ProjectionPolicy::Optimistic => true,
            ProjectionPolicy::Deferred => seq <= frontier,
        }
    }

    /// Highest seq whose logged leaf changes the projections may show, given
    /// the contiguous frontier
    pub fn visible_through(&self, frontier: u64) -> u64 {
        match self.policy {
            ProjectionPolicy::Optimistic => u64::MAX,
            ProjectionPolicy::Deferred => frontier,
        }
    }

    /// Whether held revisions must be replayed from the log when the frontier
    /// moves forward
    pub fn drains_on_advance(&self) -> bool {
        self.policy == ProjectionPolicy::Deferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_watermark() {
        assert_eq!(admit(5, None), Admission::Apply);
        assert_eq!(admit(5, Some(4)), Admission::Apply);
        assert_eq!(admit(5, Some(5)), Admission::Apply);
        assert_eq!(admit(4, Some(5)), Admission::Stale);
    }

    #[test]
    fn test_deferred_holds_above_frontier() {
        let gate = ConsistencyGate::new(ProjectionPolicy::Deferred);
        assert!(gate.releases(3, 3));
        assert!(gate.releases(2, 3));
        assert!(!gate.releases(4, 3));
        assert!(gate.drains_on_advance());
        assert_eq!(gate.visible_through(3), 3);
    }

    #[test]
    fn test_optimistic_releases_everything() {
        let gate = ConsistencyGate::new(ProjectionPolicy::Optimistic);
        assert!(gate.releases(100, 3));
        assert!(!gate.drains_on_advance());
        assert_eq!(gate.visible_through(3), u64::MAX);
    }

    #[test]
    fn test_default_policy_is_deferred() {
        assert_eq!(ProjectionPolicy::default(), ProjectionPolicy::Deferred);
        assert_eq!(ConsistencyGate::default().policy(), ProjectionPolicy::Deferred);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(ProjectionPolicy::parse("Deferred"), Some(ProjectionPolicy::Deferred));
        assert_eq!(
            ProjectionPolicy::parse(" optimistic "),
            Some(ProjectionPolicy::Optimistic)
        );
        assert_eq!(ProjectionPolicy::parse("eager"), None);
        assert_eq!(ProjectionPolicy::Optimistic.to_string(), "optimistic");
    }
}
