//! Keyed storage values exchanged with the flow.

use serde::{Deserialize, Serialize};

use crate::{Age, PlayerId};

/// Storage region of a key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageRegion {
    /// Save slots.
    Slots,
    /// Score boards.
    Scores,
    /// Counters.
    Counts,
    /// Arbitrary values.
    Values,
}

/// A storage key: region plus key within the region, optionally scoped to a user.
///
/// A `user_id` equal to [`StorageKey::JOINED_PLAYER`] is replaced by the id of the joining
/// participant when the key is resolved for a Join event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    /// Region.
    pub region: StorageRegion,
    /// Key within the region.
    pub region_key: String,
    /// Owning user, if the key is user scoped.
    pub user_id: Option<String>,
}

impl StorageKey {
    /// Placeholder for the joining participant's id.
    pub const JOINED_PLAYER: &'static str = "$joined";

    /// Creates an unscoped key.
    #[must_use]
    pub fn new(region: StorageRegion, region_key: impl Into<String>) -> Self {
        Self {
            region,
            region_key: region_key.into(),
            user_id: None,
        }
    }

    /// Scopes the key to `user_id`.
    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Returns a copy with the joined-player placeholder replaced by `player`.
    #[must_use]
    pub fn resolve_for(&self, player: Option<&PlayerId>) -> Self {
        match (&self.user_id, player) {
            (Some(user), Some(player)) if user == Self::JOINED_PLAYER => {
                self.clone().for_user(player.as_str())
            },
            _ => self.clone(),
        }
    }
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageValue {
    /// Numeric value.
    Number(f64),
    /// Text value.
    Text(String),
}

/// How a put combines with the existing value.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoragePutOption {
    /// Replace.
    #[default]
    Overwrite,
    /// Add to the existing number.
    Increment,
    /// Subtract from the existing number.
    Decrement,
    /// Keep the larger number.
    Max,
    /// Keep the smaller number.
    Min,
}

/// Values fetched for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEntry {
    /// The key.
    pub key: StorageKey,
    /// Values stored under it (several for keys matching multiple users).
    pub values: Vec<StorageValue>,
}

/// Read view over a batch of fetched entries.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StorageValueStore {
    entries: Vec<StorageEntry>,
}

impl StorageValueStore {
    /// Wraps fetched entries.
    #[must_use]
    pub fn new(entries: Vec<StorageEntry>) -> Self {
        Self { entries }
    }

    /// Values for `key`, if it was fetched.
    #[must_use]
    pub fn get(&self, key: &StorageKey) -> Option<&[StorageValue]> {
        self.entries
            .iter()
            .find(|entry| &entry.key == key)
            .map(|entry| entry.values.as_slice())
    }

    /// All entries.
    #[must_use]
    pub fn entries(&self) -> &[StorageEntry] {
        &self.entries
    }

    /// Consumes the store.
    #[must_use]
    pub fn into_entries(self) -> Vec<StorageEntry> {
        self.entries
    }
}

/// Identifies a pending storage load.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LoaderId(pub(crate) u64);

/// A completed storage load, handed to
/// [`Simulation::on_storage_loaded`](crate::Simulation::on_storage_loaded).
///
/// `age` is the tick age that carried the values; passing it back as the serialization to a
/// later [`StepContext::storage_get`](crate::StepContext::storage_get) re-requests the same data
/// from the tick log.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageLoaded {
    /// The loader this completes.
    pub loader: LoaderId,
    /// Age of the tick carrying the values.
    pub age: Age,
    /// The values.
    pub values: StorageValueStore,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn joined_player_placeholder_is_resolved() {
        let key =
            StorageKey::new(StorageRegion::Values, "coins").for_user(StorageKey::JOINED_PLAYER);
        let resolved = key.resolve_for(Some(&PlayerId::from("p7")));
        assert_eq!(resolved.user_id.as_deref(), Some("p7"));

        let fixed = StorageKey::new(StorageRegion::Values, "coins").for_user("owner");
        assert_eq!(fixed.resolve_for(Some(&PlayerId::from("p7"))), fixed);
        assert_eq!(key.resolve_for(None), key);
    }

    #[test]
    fn value_store_lookup() {
        let key = StorageKey::new(StorageRegion::Scores, "best");
        let store = StorageValueStore::new(vec![StorageEntry {
            key: key.clone(),
            values: vec![StorageValue::Number(9.0)],
        }]);
        assert_eq!(store.get(&key), Some(&[StorageValue::Number(9.0)][..]));
        assert!(store
            .get(&StorageKey::new(StorageRegion::Scores, "worst"))
            .is_none());
        assert_eq!(store.entries().len(), 1);
    }
}
