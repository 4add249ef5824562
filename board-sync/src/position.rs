//! Fractional ordering keys.
//!
//! Items in a collection are sorted by an `f64` key. Inserting between two
//! neighbors takes the midpoint, so no other item is renumbered:
//!
//! ```text
//!   1024 ──────────── 2048           insert at index 1
//!   1024 ──── 1536 ── 2048
//! ```
//!
//! Repeated halving eventually runs out of precision. Once the gap drops
//! under `epsilon` the allocator refuses with [`AllocationExhausted`] and the
//! caller rebalances that one collection back to even spacing.

use uuid::Uuid;

use crate::model::{display_order, Item, ItemId, Placement};

/// Key handed out for the first item of an empty collection.
pub const DEFAULT_BASE: f64 = 1024.0;
/// Distance between keys when appending or rebalancing.
pub const DEFAULT_STEP: f64 = 1024.0;
/// Smallest gap the allocator will still split.
pub const DEFAULT_EPSILON: f64 = 1e-9;

/// The neighbors leave no representable key between them.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("no usable ordering key between {prev:?} and {next:?}")]
pub struct AllocationExhausted {
    pub prev: Option<f64>,
    pub next: Option<f64>,
}

/// Allocator constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocatorConfig {
    pub base: f64,
    pub step: f64,
    pub epsilon: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            step: DEFAULT_STEP,
            epsilon: DEFAULT_EPSILON,
        }
    }
}

/// New key between `prev` and `next` using the default constants.
pub fn allocate(prev: Option<f64>, next: Option<f64>) -> Result<f64, AllocationExhausted> {
    AllocatorConfig::default().allocate(prev, next)
}

/// Evenly spaced keys for `items`, keeping their current order.
pub fn rebalance(items: &[Item]) -> Vec<(ItemId, f64)> {
    AllocatorConfig::default().rebalance(items)
}

impl AllocatorConfig {
    /// Compute a key strictly between `prev` and `next`.
    ///
    /// An open bound means insertion at that end of the collection.
    pub fn allocate(
        &self,
        prev: Option<f64>,
        next: Option<f64>,
    ) -> Result<f64, AllocationExhausted> {
        let exhausted = AllocationExhausted { prev, next };
        let key = match (prev, next) {
            (None, None) => return Ok(self.base),
            (None, Some(n)) => {
                let key = n / 2.0;
                if !(key < n) || n - key < self.epsilon {
                    return Err(exhausted);
                }
                key
            }
            (Some(p), None) => {
                let key = p + self.step;
                if !(key > p) {
                    return Err(exhausted);
                }
                key
            }
            (Some(p), Some(n)) => {
                if !(p < n) || n - p < self.epsilon {
                    return Err(exhausted);
                }
                let key = (p + n) / 2.0;
                if !(p < key && key < n) {
                    return Err(exhausted);
                }
                key
            }
        };

        if key.is_finite() {
            Ok(key)
        } else {
            Err(exhausted)
        }
    }

    /// Reassign `base, base + step, ...` to the items in display order.
    pub fn rebalance(&self, items: &[Item]) -> Vec<(ItemId, f64)> {
        let mut ordered: Vec<&Item> = items.iter().collect();
        ordered.sort_by(|a, b| display_order(a, b));
        ordered
            .into_iter()
            .enumerate()
            .map(|(i, item)| (item.id, self.key_at(i)))
            .collect()
    }

    /// Same as [`rebalance`](Self::rebalance) over wire placements.
    pub fn rebalance_placements(&self, placements: &[Placement]) -> Vec<Placement> {
        let mut ordered: Vec<Placement> = placements.to_vec();
        ordered.sort_by(|a, b| a.position.total_cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        ordered
            .into_iter()
            .enumerate()
            .map(|(i, p)| Placement {
                id: p.id,
                position: self.key_at(i),
            })
            .collect()
    }

    fn key_at(&self, index: usize) -> f64 {
        self.base + self.step * index as f64
    }
}

/// Bounds around drop slot `target_index` of a collection in display order.
///
/// `moving` is left out first so a same-collection reorder counts indexes
/// as the user sees them after picking the item up. Indexes past the end
/// clamp to the tail.
pub fn neighbors(
    collection: &[&Item],
    target_index: usize,
    moving: Option<ItemId>,
) -> (Option<f64>, Option<f64>) {
    let remaining: Vec<f64> = collection
        .iter()
        .filter(|item| Some(item.id) != moving)
        .map(|item| item.position)
        .collect();
    bounds_at(&remaining, target_index)
}

/// [`neighbors`] for wire placements (used by the persistence side).
pub fn placement_neighbors(
    ordered: &[Placement],
    target_index: usize,
    moving: Option<Uuid>,
) -> (Option<f64>, Option<f64>) {
    let remaining: Vec<f64> = ordered
        .iter()
        .filter(|p| Some(p.id) != moving)
        .map(|p| p.position)
        .collect();
    bounds_at(&remaining, target_index)
}

fn bounds_at(keys: &[f64], target_index: usize) -> (Option<f64>, Option<f64>) {
    let index = target_index.min(keys.len());
    let prev = index.checked_sub(1).and_then(|i| keys.get(i)).copied();
    let next = keys.get(index).copied();
    (prev, next)
}
