use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use z1_data::items;

/// Monotonic inventory: items only flip false to true (except upgrade
/// replacement) and levels only increase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerInventory {
    pub items: BTreeMap<String, bool>,
    pub sword_level: u8,
    pub arrows_level: u8,
}

#[derive(Debug, Clone, Default)]
pub struct PlayerItemTracker {
    inventory: PlayerInventory,
}

impl PlayerItemTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inventory(&self) -> &PlayerInventory {
        &self.inventory
    }

    pub fn has(&self, item: &str) -> bool {
        self.inventory.items.get(item).copied().unwrap_or(false)
    }

    /// Record an item as obtained. Returns true if it was newly set.
    ///
    /// Obtaining the better half of an upgrade pair clears the lesser item.
    /// The lesser item is ignored once its replacement is owned.
    pub fn record_obtained(&mut self, item: &str) -> bool {
        if self.has(item) {
            return false;
        }
        if let Some(superior) = items::superior_of(item) {
            if self.has(superior) {
                debug!("Ignoring {} (already upgraded to {})", item, superior);
                return false;
            }
        }
        if let Some(inferior) = items::inferior_of(item) {
            if self.has(inferior) {
                self.inventory.items.insert(inferior.to_string(), false);
            }
        }
        self.inventory.items.insert(item.to_string(), true);
        debug!("Item obtained: {}", item);
        true
    }

    /// Returns true if the sword level increased.
    pub fn observe_sword_level(&mut self, level: u8) -> bool {
        if level > self.inventory.sword_level {
            self.inventory.sword_level = level;
            true
        } else {
            false
        }
    }

    /// Returns true if the arrows level increased.
    pub fn observe_arrows_level(&mut self, level: u8) -> bool {
        if level > self.inventory.arrows_level {
            self.inventory.arrows_level = level;
            true
        } else {
            false
        }
    }

    /// An item seen in the B slot is owned. Arrows also imply the bow.
    pub fn observe_b_item(&mut self, name: &str) {
        self.record_obtained(name);
        if let Some(level) = items::arrows_level(name) {
            self.record_obtained(items::BOW);
            self.observe_arrows_level(level);
        }
    }

    /// Merge a full subscreen inventory scan.
    ///
    /// `true` is accepted unconditionally; `false` only fills in items with
    /// no prior record, so one bad read cannot un-obtain anything.
    pub fn merge_subscreen(&mut self, scan: &BTreeMap<String, bool>) {
        for (item, &owned) in scan {
            if owned {
                self.record_obtained(item);
            } else {
                self.inventory.items.entry(item.clone()).or_insert(false);
            }
        }
    }
}
