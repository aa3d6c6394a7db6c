//! Continual-learning knowledge hooks (§4.6) — items enriched into the
//! agent's prompt before a run and captured from its report after one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The shape of a knowledge item (§4.6: `type ∈ {pattern, correction,
/// gotcha, context}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeItemType {
    /// A reusable approach worth repeating.
    Pattern,
    /// A correction distilled from a steering instruction (§4.6 capture).
    Correction,
    /// A known pitfall worth warning the agent about.
    Gotcha,
    /// Standing background context supplied out-of-band.
    Context,
}

/// One persisted knowledge item (§4.6, §6.3 — stored via the YAML-backed
/// knowledge store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub item_type: KnowledgeItemType,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Confidence in `[0.0, 1.0]`; governs enrich-digest ordering and
    /// capture dedup (§4.6: "items are ranked by confidence").
    pub confidence: f32,
    /// Number of times this item has been included in an enrich digest.
    /// Additive bookkeeping beyond the distilled spec's enrich/capture
    /// contract — see SPEC_FULL.md §4.6 supplement.
    #[serde(default)]
    pub times_applied: u32,
    /// Last time this item was included in an enrich digest.
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Provenance tag (§4.6 capture: `source = "steering_extracted"` for
    /// items distilled from a steering correction; `"manual"` otherwise).
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "manual".to_string()
}

impl KnowledgeItem {
    pub fn new(item_type: KnowledgeItemType, text: impl Into<String>, confidence: f32) -> Self {
        let text = text.into();
        Self {
            id: format!("{item_type:?}-{:x}", simple_hash(&text)),
            item_type,
            text,
            tags: Vec::new(),
            created_at: Utc::now(),
            confidence: confidence.clamp(0.0, 1.0),
            times_applied: 0,
            last_used_at: None,
            source: default_source(),
        }
    }

    /// Construct an item captured from a steering correction (§4.6
    /// capture step).
    pub fn from_steering(text: impl Into<String>, confidence: f32) -> Self {
        let mut item = Self::new(KnowledgeItemType::Correction, text, confidence);
        item.source = "steering_extracted".to_string();
        item
    }

    /// Record that this item was surfaced in an enrich digest just now
    /// (§4.6 supplement).
    pub fn mark_applied(&mut self, now: DateTime<Utc>) {
        self.times_applied += 1;
        self.last_used_at = Some(now);
    }
}

fn simple_hash(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// A bundle of items selected for one enrich call, ordered by confidence
/// descending, then by fewest `times_applied` (so stale-but-confident
/// items don't crowd out everything else).
#[derive(Debug, Clone, Default)]
pub struct EnrichDigest {
    pub items: Vec<KnowledgeItem>,
}

impl EnrichDigest {
    pub fn select(mut candidates: Vec<KnowledgeItem>, max_items: usize) -> Self {
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.times_applied.cmp(&b.times_applied))
        });
        candidates.truncate(max_items);
        Self { items: candidates }
    }

    /// Render the digest as agent-prompt-ready text, one item per line.
    pub fn render(&self) -> String {
        self.items
            .iter()
            .map(|i| format!("- {}", i.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(text: &str, confidence: f32, times_applied: u32) -> KnowledgeItem {
        let mut i = KnowledgeItem::new(KnowledgeItemType::Pattern, text, confidence);
        i.times_applied = times_applied;
        i
    }

    #[test]
    fn digest_orders_by_confidence_then_freshness() {
        let candidates = vec![
            item("low conf", 0.2, 0),
            item("high conf, overused", 0.9, 10),
            item("high conf, fresh", 0.9, 0),
        ];
        let digest = EnrichDigest::select(candidates, 2);
        assert_eq!(digest.items.len(), 2);
        assert_eq!(digest.items[0].text, "high conf, fresh");
        assert_eq!(digest.items[1].text, "high conf, overused");
    }

    #[test]
    fn mark_applied_bumps_counter_and_timestamp() {
        let mut i = item("x", 0.5, 0);
        assert!(i.last_used_at.is_none());
        let now = Utc::now();
        i.mark_applied(now);
        assert_eq!(i.times_applied, 1);
        assert_eq!(i.last_used_at, Some(now));
    }
}
