use std::sync::Arc;

use tracing::warn;

use pos_catalog::{CatalogCache, ProductCatalog};
use pos_detect::Detection;

use crate::LineItem;

/// What one applied batch did to the session view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// True when any key is new or any quantity differs from the previous
    /// batch — raised at most once per batch, regardless of how many items
    /// changed. Drives the audible cue.
    pub changed: bool,
    pub item_count: usize,
}

/// Turns raw detections into priced line items for one capture session.
///
/// Each batch *replaces* the session view rather than merging into it: a
/// session models continuous observation of one scene, so quantities must
/// reflect the latest detector snapshot, not a running sum of duplicate
/// sightings. Accumulation across sessions happens later, in the cart
/// merge.
pub struct SessionAccumulator {
    catalog: Arc<dyn ProductCatalog>,
    cache: CatalogCache,
    session_items: Vec<LineItem>,
    previous_items: Vec<LineItem>,
}

impl SessionAccumulator {
    pub fn new(catalog: Arc<dyn ProductCatalog>, cache: CatalogCache) -> Self {
        Self {
            catalog,
            cache,
            session_items: Vec::new(),
            previous_items: Vec::new(),
        }
    }

    /// Applies one decoded batch: resolves every id through the cache
    /// (fetching and caching on miss), rebuilds the session view, and
    /// diffs it against the previous snapshot.
    ///
    /// A failed lookup skips that id and never aborts the rest of the
    /// batch. Callers must invoke this serially per session so an older
    /// batch cannot overwrite a newer one.
    pub async fn apply_detections(&mut self, detections: &[Detection]) -> BatchOutcome {
        let mut next: Vec<LineItem> = Vec::with_capacity(detections.len());

        for detection in detections {
            let record = match self.cache.get(&detection.id).await {
                Some(record) => record,
                None => match self.catalog.product_detail(&detection.id).await {
                    Ok(record) => {
                        self.cache.insert(record.clone()).await;
                        record
                    }
                    Err(err) => {
                        warn!(product_id = %detection.id, "product lookup failed: {err}");
                        continue;
                    }
                },
            };

            let item = LineItem::from_product(&record, detection.quantity);
            // One entry per distinct key; a repeated id in the same batch
            // takes the latest reported quantity.
            match next.iter_mut().find(|existing| existing.key() == item.key()) {
                Some(existing) => *existing = item,
                None => next.push(item),
            }
        }

        let changed = Self::differs(&self.previous_items, &next);
        self.previous_items = next.clone();
        self.session_items = next;

        BatchOutcome {
            changed,
            item_count: self.session_items.len(),
        }
    }

    fn differs(previous: &[LineItem], next: &[LineItem]) -> bool {
        next.iter().any(|item| {
            previous
                .iter()
                .find(|old| old.key() == item.key())
                .map_or(true, |old| old.quantity != item.quantity)
        })
    }

    pub fn session_items(&self) -> &[LineItem] {
        &self.session_items
    }

    /// Hands the session view to the cart merge, leaving the accumulator
    /// empty for any late-arriving batches.
    pub fn take_session_items(&mut self) -> Vec<LineItem> {
        std::mem::take(&mut self.session_items)
    }

    /// Clears both snapshots for a fresh session.
    pub fn reset(&mut self) {
        self.session_items.clear();
        self.previous_items.clear();
    }
}
