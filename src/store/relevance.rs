//! Relevance ranking for capability retrieval.
//!
//! Ambient agent state (needs, emotional signals) reaches ranking only
//! through [`AmbientContext`], passed explicitly by the caller.  The default
//! [`TagOverlap`] strategy ignores it entirely.

use super::CapabilityEntry;
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// AmbientContext
// ---------------------------------------------------------------------------

/// Named signals in `[0, 1]`, e.g. `curiosity = 0.8`, `caution = 0.3`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmbientContext {
    signals: BTreeMap<String, f64>,
}

impl AmbientContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Levels are clamped into `[0, 1]`.
    pub fn with_signal(mut self, name: impl Into<String>, level: f64) -> Self {
        self.signals.insert(name.into(), level.clamp(0.0, 1.0));
        self
    }

    pub fn level(&self, name: &str) -> f64 {
        self.signals.get(name).copied().unwrap_or(0.0)
    }

    /// Signals at or above `threshold`.
    pub fn dominant(&self, threshold: f64) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.signals
            .iter()
            .filter(move |(_, level)| **level >= threshold)
            .map(|(name, level)| (name.as_str(), *level))
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Scores one entry against a query.  Zero means "not relevant".
pub trait RelevanceStrategy: Send + Sync {
    fn score(&self, entry: &CapabilityEntry, query: &BTreeSet<String>, ambient: &AmbientContext) -> f64;

    fn name(&self) -> &'static str;
}

/// Number of query tags the entry carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagOverlap;

impl RelevanceStrategy for TagOverlap {
    fn score(&self, entry: &CapabilityEntry, query: &BTreeSet<String>, _ambient: &AmbientContext) -> f64 {
        entry.scope_tags.intersection(query).count() as f64
    }

    fn name(&self) -> &'static str {
        "tag-overlap"
    }
}

/// Tag overlap, boosted for entries tagged with a dominant ambient signal.
/// Entries with no tag overlap stay at zero regardless of mood.
#[derive(Debug, Clone, Copy)]
pub struct AmbientWeighted {
    pub weight: f64,
    pub threshold: f64,
}

impl Default for AmbientWeighted {
    fn default() -> Self {
        Self { weight: 0.5, threshold: 0.6 }
    }
}

impl RelevanceStrategy for AmbientWeighted {
    fn score(&self, entry: &CapabilityEntry, query: &BTreeSet<String>, ambient: &AmbientContext) -> f64 {
        let overlap = entry.scope_tags.intersection(query).count() as f64;
        if overlap == 0.0 {
            return 0.0;
        }
        let boost: f64 = ambient
            .dominant(self.threshold)
            .filter(|(name, _)| entry.scope_tags.contains(*name))
            .map(|(_, level)| level)
            .sum();
        overlap + self.weight * boost
    }

    fn name(&self) -> &'static str {
        "ambient-weighted"
    }
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

/// Score, filter and order candidates: score descending, then
/// `accepted_at_ms` descending, then insertion sequence ascending.
/// `candidates` yields `(entry, insertion_seq)`; inactive entries are skipped.
pub fn rank<'a>(
    candidates: impl Iterator<Item = (&'a CapabilityEntry, u64)>,
    query: &BTreeSet<String>,
    k: usize,
    ambient: &AmbientContext,
    strategy: &dyn RelevanceStrategy,
) -> Vec<CapabilityEntry> {
    let mut scored: Vec<(f64, &CapabilityEntry, u64)> = candidates
        .filter(|(entry, _)| entry.active)
        .map(|(entry, seq)| (strategy.score(entry, query, ambient), entry, seq))
        .filter(|(score, _, _)| *score > 0.0)
        .collect();

    scored.sort_by(|a, b| {
        b.0.total_cmp(&a.0)
            .then_with(|| b.1.accepted_at_ms.cmp(&a.1.accepted_at_ms))
            .then_with(|| a.2.cmp(&b.2))
    });
    scored.into_iter().take(k).map(|(_, entry, _)| entry.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CandidateArtifact;
    use proptest::prelude::*;

    fn entry(content: &str, tags: &[&str], accepted_at_ms: u64) -> CapabilityEntry {
        let mut e = CapabilityEntry::new(CandidateArtifact::principle(content, "t"), 0, 1);
        e.scope_tags = tags.iter().map(|t| t.to_string()).collect();
        e.accepted_at_ms = accepted_at_ms;
        e
    }

    fn query(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_higher_overlap_ranks_first() {
        let a = entry("a", &["csv"], 10);
        let b = entry("b", &["csv", "parse"], 1);
        let ranked = rank(
            vec![(&a, 0), (&b, 1)].into_iter(),
            &query(&["csv", "parse"]),
            5,
            &AmbientContext::new(),
            &TagOverlap,
        );
        assert_eq!(ranked[0].artifact.content, "b");
    }

    #[test]
    fn test_recency_breaks_score_ties() {
        let old = entry("old", &["csv"], 1);
        let new = entry("new", &["csv"], 2);
        let ranked = rank(
            vec![(&old, 0), (&new, 1)].into_iter(),
            &query(&["csv"]),
            5,
            &AmbientContext::new(),
            &TagOverlap,
        );
        assert_eq!(ranked[0].artifact.content, "new");
    }

    #[test]
    fn test_insertion_order_breaks_full_ties() {
        let first = entry("first", &["csv"], 5);
        let second = entry("second", &["csv"], 5);
        let ranked = rank(
            vec![(&second, 7), (&first, 3)].into_iter(),
            &query(&["csv"]),
            5,
            &AmbientContext::new(),
            &TagOverlap,
        );
        assert_eq!(ranked[0].artifact.content, "first");
        assert_eq!(ranked[1].artifact.content, "second");
    }

    #[test]
    fn test_zero_score_and_inactive_excluded() {
        let unrelated = entry("unrelated", &["math"], 1);
        let mut inactive = entry("inactive", &["csv"], 1);
        inactive.active = false;
        let ranked = rank(
            vec![(&unrelated, 0), (&inactive, 1)].into_iter(),
            &query(&["csv"]),
            5,
            &AmbientContext::new(),
            &TagOverlap,
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_ambient_boost_reorders_equal_overlap() {
        let calm = entry("calm", &["plan"], 2);
        let cautious = entry("cautious", &["plan", "caution"], 1);
        let ambient = AmbientContext::new().with_signal("caution", 0.9);
        let q = query(&["plan"]);

        let plain = rank(vec![(&calm, 0), (&cautious, 1)].into_iter(), &q, 2, &ambient, &TagOverlap);
        assert_eq!(plain[0].artifact.content, "calm");

        let weighted = rank(
            vec![(&calm, 0), (&cautious, 1)].into_iter(),
            &q,
            2,
            &ambient,
            &AmbientWeighted::default(),
        );
        assert_eq!(weighted[0].artifact.content, "cautious");
    }

    #[test]
    fn test_ambient_alone_does_not_make_entry_relevant() {
        let e = entry("e", &["caution"], 1);
        let ambient = AmbientContext::new().with_signal("caution", 1.0);
        let score = AmbientWeighted::default().score(&e, &query(&["csv"]), &ambient);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_signal_levels_are_clamped() {
        let ambient = AmbientContext::new().with_signal("x", 3.0).with_signal("y", -1.0);
        assert_eq!(ambient.level("x"), 1.0);
        assert_eq!(ambient.level("y"), 0.0);
        assert_eq!(ambient.level("missing"), 0.0);
    }

    proptest! {
        #[test]
        fn prop_rank_respects_k_and_order(
            tag_sets in proptest::collection::vec(proptest::collection::btree_set("[a-d]", 0..4), 0..12),
            k in 0usize..8,
        ) {
            let entries: Vec<CapabilityEntry> = tag_sets
                .iter()
                .enumerate()
                .map(|(i, tags)| {
                    let mut e = entry(&format!("p{}", i), &[], i as u64 % 3);
                    e.scope_tags = tags.clone();
                    e
                })
                .collect();
            let q = query(&["a", "b"]);
            let ranked = rank(
                entries.iter().zip(0u64..),
                &q,
                k,
                &AmbientContext::new(),
                &TagOverlap,
            );
            prop_assert!(ranked.len() <= k);
            let scores: Vec<usize> = ranked.iter().map(|e| e.scope_tags.intersection(&q).count()).collect();
            prop_assert!(scores.iter().all(|s| *s > 0));
            prop_assert!(scores.windows(2).all(|w| w[0] >= w[1]));
        }
    }
}
