//! Continual-learning hooks (§4.6): two non-blocking activity points the
//! transform workflow offers around a task's run. Both are optional —
//! absent `task.knowledge` or an absent `KnowledgeStore` disables them
//! entirely — and both swallow their own failures rather than ever
//! failing the task they're attached to.

use tracing::warn;

use crate::domain::models::knowledge::{EnrichDigest, KnowledgeItem};
use crate::domain::models::steering::SteeringHistoryEntry;
use crate::domain::models::task::KnowledgeConfig;
use crate::domain::ports::KnowledgeStore;

const DEFAULT_MAX_ENRICH_ITEMS: usize = 5;

/// Enrich (before the initial transformation, §4.6): fetch up to
/// `max_items` stored items matching the task's tags, ranked by
/// confidence, and render them into a digest to prepend to the prompt.
/// Returns `None` if enrichment is disabled, no store is configured, no
/// items matched, or the store failed — in every case the original
/// prompt is used unchanged.
pub async fn enrich(store: Option<&dyn KnowledgeStore>, config: Option<&KnowledgeConfig>) -> Option<String> {
    let store = store?;
    let config = config?;
    if config.enrich_disabled {
        return None;
    }
    let max_items = config.max_items.unwrap_or(DEFAULT_MAX_ENRICH_ITEMS as u32) as usize;

    match store.list(&config.tags).await {
        Ok(candidates) => {
            let digest = EnrichDigest::select(candidates, max_items);
            if digest.items.is_empty() {
                None
            } else {
                Some(digest.render())
            }
        }
        Err(err) => {
            warn!(error = %err, "knowledge enrich failed, proceeding with original prompt");
            None
        }
    }
}

/// Capture (after approval, when steering history is non-empty, §4.6):
/// summarize each steering correction into a `KnowledgeItem` and persist
/// it. Failure to persist any single item is logged and skipped rather
/// than aborted.
pub async fn capture(store: Option<&dyn KnowledgeStore>, config: Option<&KnowledgeConfig>, history: &[SteeringHistoryEntry]) {
    let Some(store) = store else { return };
    let Some(config) = config else { return };
    if config.capture_disabled || history.is_empty() {
        return;
    }

    for entry in history {
        let prompt = match &entry.instruction.action {
            crate::domain::models::steering::SteeringAction::Steer { prompt } => prompt.clone(),
            _ => continue,
        };
        let mut item = KnowledgeItem::from_steering(format!("iteration {}: {}", entry.iteration, prompt), 0.6);
        item.tags = config.tags.clone();
        if let Err(err) = store.put(item).await {
            warn!(error = %err, "failed to persist captured knowledge item");
        }
    }
}
