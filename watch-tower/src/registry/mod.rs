// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory model of the per-chain conditional-order registry and its
//! durable representation.
//!
//! The registry is loaded once at chain-watcher start, mutated in-process
//! by the block processor, and persisted after each block-processing step
//! as one atomic batch. The on-disk schema is versioned; a persisted
//! version newer than this binary refuses to load, an older one runs an
//! explicit migration. Serialisation uses explicit arrays of pairs so the
//! mapping and set types round-trip without reviver hooks.

pub mod store;

use crate::error::{WatchError, WatchResult};
use crate::types::{ConditionalOrder, RegistryBlock};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use std::collections::BTreeMap;
use self::store::{
    storage_key, RegistryStore, KEY_LAST_NOTIFIED_ERROR, KEY_LAST_PROCESSED_BLOCK, KEY_REGISTRY,
    KEY_REGISTRY_VERSION,
};
use tracing::{debug, info, warn};

/// Current on-disk schema version
pub const REGISTRY_VERSION: u32 = 1;

type OwnerOrdersDoc = Vec<(Address, Vec<ConditionalOrder>)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    pub version: u32,
    pub owner_orders: BTreeMap<Address, Vec<ConditionalOrder>>,
    pub last_processed_block: Option<RegistryBlock>,
    pub last_notified_error: Option<DateTime<Utc>>,
    pub network: String,
}

impl Registry {
    pub fn new(network: String) -> Self {
        Self {
            version: REGISTRY_VERSION,
            owner_orders: BTreeMap::new(),
            last_processed_block: None,
            last_notified_error: None,
            network,
        }
    }

    /// Loads the registry for `network`, tolerating missing keys. A missing
    /// version key means an empty registry at the current schema.
    pub fn load(store: &RegistryStore, network: &str) -> WatchResult<Self> {
        let version = match store.get(&storage_key(KEY_REGISTRY_VERSION, network))? {
            Some(raw) => {
                let text = String::from_utf8(raw)
                    .map_err(|e| WatchError::Serialization(format!("version key: {}", e)))?;
                text.trim()
                    .parse::<u32>()
                    .map_err(|e| WatchError::Serialization(format!("version '{}': {}", text, e)))?
            }
            None => REGISTRY_VERSION,
        };
        if version > REGISTRY_VERSION {
            return Err(WatchError::SchemaVersion {
                found: version,
                expected: REGISTRY_VERSION,
            });
        }

        let owner_orders = match store.get(&storage_key(KEY_REGISTRY, network))? {
            Some(raw) => {
                let doc: OwnerOrdersDoc = serde_json::from_slice(&raw)
                    .map_err(|e| WatchError::Serialization(format!("registry: {}", e)))?;
                doc.into_iter().collect()
            }
            None => BTreeMap::new(),
        };

        let last_processed_block =
            match store.get(&storage_key(KEY_LAST_PROCESSED_BLOCK, network))? {
                Some(raw) => Some(serde_json::from_slice(&raw).map_err(|e| {
                    WatchError::Serialization(format!("last processed block: {}", e))
                })?),
                None => None,
            };

        let last_notified_error =
            match store.get(&storage_key(KEY_LAST_NOTIFIED_ERROR, network))? {
                Some(raw) => {
                    let text = String::from_utf8(raw).map_err(|e| {
                        WatchError::Serialization(format!("last notified error: {}", e))
                    })?;
                    Some(
                        DateTime::parse_from_rfc3339(text.trim())
                            .map_err(|e| {
                                WatchError::Serialization(format!(
                                    "last notified error '{}': {}",
                                    text, e
                                ))
                            })?
                            .with_timezone(&Utc),
                    )
                }
                None => None,
            };

        let mut registry = Self {
            version,
            owner_orders,
            last_processed_block,
            last_notified_error,
            network: network.to_string(),
        };
        if registry.version < REGISTRY_VERSION {
            registry.migrate()?;
        }

        info!(
            "[{}] Registry loaded: {} owner(s), {} order(s), cursor {:?}",
            registry.network,
            registry.num_owners(),
            registry.num_orders(),
            registry.last_processed_block.as_ref().map(|b| b.number)
        );
        Ok(registry)
    }

    /// Runs schema migrations from `self.version` up to the current
    /// version. Each bump gets a written step here; v1 is the first schema
    /// so the table is currently empty and any lower persisted version is
    /// corrupt rather than old.
    fn migrate(&mut self) -> WatchResult<()> {
        if self.version < REGISTRY_VERSION {
            return Err(WatchError::SchemaVersion {
                found: self.version,
                expected: REGISTRY_VERSION,
            });
        }
        Ok(())
    }

    /// Inserts a conditional order under `owner`. No-op if the params
    /// triple is already present for that owner.
    pub fn add(&mut self, owner: Address, order: ConditionalOrder) -> bool {
        let is_new_owner = !self.owner_orders.contains_key(&owner);
        let orders = self.owner_orders.entry(owner).or_default();
        if orders.iter().any(|o| o.params == order.params) {
            debug!(
                "[{}] Conditional order {:#x} already registered for owner {:#x}",
                self.network,
                order.params.id(),
                owner
            );
            return false;
        }
        debug!(
            "[{}] Registering conditional order {:#x} for {} owner {:#x}",
            self.network,
            order.params.id(),
            if is_new_owner { "new" } else { "existing" },
            owner
        );
        orders.push(order);
        true
    }

    /// Removes every conditional order of `owner` whose proof names a
    /// merkle root other than `new_root`. Single orders (no proof) are
    /// untouched.
    pub fn flush(&mut self, owner: Address, new_root: H256) {
        let Some(orders) = self.owner_orders.get_mut(&owner) else {
            return;
        };
        let before = orders.len();
        orders.retain(|order| {
            order
                .proof
                .as_ref()
                .map_or(true, |proof| proof.merkle_root == new_root)
        });
        let dropped = before - orders.len();
        if dropped > 0 {
            info!(
                "[{}] Flushed {} superseded merkle order(s) for owner {:#x}",
                self.network, dropped, owner
            );
        }
        if orders.is_empty() {
            self.owner_orders.remove(&owner);
        }
    }

    /// Deletes a single conditional order identified by its params id.
    pub fn delete_order(&mut self, owner: Address, params_id: H256) -> bool {
        let Some(orders) = self.owner_orders.get_mut(&owner) else {
            return false;
        };
        let before = orders.len();
        orders.retain(|order| order.params.id() != params_id);
        let removed = orders.len() < before;
        if orders.is_empty() {
            self.owner_orders.remove(&owner);
        }
        removed
    }

    pub fn get_order_mut(
        &mut self,
        owner: Address,
        params_id: H256,
    ) -> Option<&mut ConditionalOrder> {
        self.owner_orders
            .get_mut(&owner)?
            .iter_mut()
            .find(|order| order.params.id() == params_id)
    }

    pub fn num_owners(&self) -> usize {
        self.owner_orders.len()
    }

    pub fn num_orders(&self) -> usize {
        self.owner_orders.values().map(Vec::len).sum()
    }

    /// Persists the whole registry as one atomic batch: version, owner
    /// orders, cursor and last-notified-error, with delete semantics for
    /// the absent optionals.
    pub fn write(&self, store: &RegistryStore) -> WatchResult<()> {
        let doc: OwnerOrdersDoc = self
            .owner_orders
            .iter()
            .map(|(owner, orders)| (*owner, orders.clone()))
            .collect();
        let serialised = serde_json::to_vec(&doc)
            .map_err(|e| WatchError::Serialization(format!("registry: {}", e)))?;

        let mut batch = store.batch();
        batch.put(
            &storage_key(KEY_REGISTRY_VERSION, &self.network),
            self.version.to_string().as_bytes(),
        );
        batch.put(&storage_key(KEY_REGISTRY, &self.network), &serialised);
        match &self.last_processed_block {
            Some(block) => {
                let raw = serde_json::to_vec(block).map_err(|e| {
                    WatchError::Serialization(format!("last processed block: {}", e))
                })?;
                batch.put(&storage_key(KEY_LAST_PROCESSED_BLOCK, &self.network), &raw);
            }
            None => batch.del(&storage_key(KEY_LAST_PROCESSED_BLOCK, &self.network)),
        }
        match &self.last_notified_error {
            Some(timestamp) => batch.put(
                &storage_key(KEY_LAST_NOTIFIED_ERROR, &self.network),
                timestamp.to_rfc3339().as_bytes(),
            ),
            None => batch.del(&storage_key(KEY_LAST_NOTIFIED_ERROR, &self.network)),
        }
        batch.commit()
    }

    /// JSON dump of the registry for the `dump-db` command.
    pub fn to_json_pretty(&self) -> WatchResult<String> {
        let doc = serde_json::json!({
            "version": self.version,
            "network": self.network,
            "lastProcessedBlock": self.last_processed_block,
            "lastNotifiedError": self.last_notified_error.map(|t| t.to_rfc3339()),
            "ownerOrders": self
                .owner_orders
                .iter()
                .map(|(owner, orders)| (owner, orders))
                .collect::<Vec<_>>(),
        });
        serde_json::to_string_pretty(&doc)
            .map_err(|e| WatchError::Serialization(format!("dump: {}", e)))
    }
}

/// Warns loudly when a loaded registry violates its own invariants; used
/// after load to surface corruption early without refusing service.
pub fn check_invariants(registry: &Registry) {
    for (owner, orders) in &registry.owner_orders {
        for (i, a) in orders.iter().enumerate() {
            for b in orders.iter().skip(i + 1) {
                if a.params == b.params {
                    warn!(
                        "[{}] Invariant violation: duplicate params for owner {:#x}",
                        registry.network, owner
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionalOrderParams, OrderStatus, OrderUid, Proof};
    use ethers::types::Bytes;
    use tempfile::TempDir;

    fn params(seed: u8) -> ConditionalOrderParams {
        ConditionalOrderParams {
            handler: Address::repeat_byte(seed),
            salt: H256::repeat_byte(seed),
            static_input: Bytes::from(vec![seed; 4]),
        }
    }

    fn order(seed: u8, proof: Option<Proof>) -> ConditionalOrder {
        ConditionalOrder::new(
            H256::repeat_byte(seed),
            params(seed),
            proof,
            Address::repeat_byte(0xcc),
        )
    }

    fn merkle_proof(root: u8) -> Option<Proof> {
        Some(Proof {
            merkle_root: H256::repeat_byte(root),
            path: vec![H256::repeat_byte(root), H256::repeat_byte(root + 1)],
        })
    }

    fn open_temp() -> (TempDir, RegistryStore) {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_add_deduplicates_by_params() {
        let owner = Address::repeat_byte(0xaa);
        let mut registry = Registry::new("1".to_string());

        assert!(registry.add(owner, order(0x01, None)));
        assert!(!registry.add(owner, order(0x01, None)));
        assert!(registry.add(owner, order(0x02, None)));
        assert_eq!(registry.num_orders(), 2);
        assert_eq!(registry.num_owners(), 1);

        // The same params under a different owner is a distinct order.
        assert!(registry.add(Address::repeat_byte(0xbb), order(0x01, None)));
        assert_eq!(registry.num_orders(), 3);
        assert_eq!(registry.num_owners(), 2);
    }

    #[test]
    fn test_flush_removes_only_stale_merkle_orders() {
        let owner = Address::repeat_byte(0xaa);
        let new_root = H256::repeat_byte(0x99);
        let mut registry = Registry::new("1".to_string());

        registry.add(owner, order(0x01, merkle_proof(0x10)));
        registry.add(owner, order(0x02, merkle_proof(0x10)));
        registry.add(
            owner,
            order(
                0x03,
                Some(Proof {
                    merkle_root: new_root,
                    path: vec![],
                }),
            ),
        );
        registry.add(owner, order(0x04, None));

        registry.flush(owner, new_root);

        let remaining = &registry.owner_orders[&owner];
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|o| o
            .proof
            .as_ref()
            .map_or(true, |p| p.merkle_root == new_root)));
    }

    #[test]
    fn test_flush_drops_empty_owner_entry() {
        let owner = Address::repeat_byte(0xaa);
        let mut registry = Registry::new("1".to_string());
        registry.add(owner, order(0x01, merkle_proof(0x10)));

        registry.flush(owner, H256::repeat_byte(0x99));
        assert_eq!(registry.num_owners(), 0);
        assert_eq!(registry.num_orders(), 0);
    }

    #[test]
    fn test_delete_order() {
        let owner = Address::repeat_byte(0xaa);
        let mut registry = Registry::new("1".to_string());
        registry.add(owner, order(0x01, None));
        registry.add(owner, order(0x02, None));

        assert!(registry.delete_order(owner, params(0x01).id()));
        assert!(!registry.delete_order(owner, params(0x01).id()));
        assert_eq!(registry.num_orders(), 1);

        assert!(registry.delete_order(owner, params(0x02).id()));
        assert_eq!(registry.num_owners(), 0);
    }

    #[test]
    fn test_write_load_round_trip() {
        let (_dir, store) = open_temp();
        let owner = Address::repeat_byte(0xaa);
        let mut registry = Registry::new("1".to_string());

        let mut tracked = order(0x01, merkle_proof(0x10));
        tracked.record_order(
            OrderUid::new(H256::repeat_byte(0x77), owner, 123),
            OrderStatus::Submitted,
        );
        registry.add(owner, tracked);
        registry.add(Address::repeat_byte(0xbb), order(0x02, None));
        registry.last_processed_block = Some(RegistryBlock {
            number: 150,
            hash: H256::repeat_byte(0x55),
            timestamp: 1_700_000_000,
        });
        registry.last_notified_error = Some(Utc::now());

        registry.write(&store).unwrap();
        let loaded = Registry::load(&store, "1").unwrap();

        assert_eq!(loaded.version, registry.version);
        assert_eq!(loaded.owner_orders, registry.owner_orders);
        assert_eq!(loaded.last_processed_block, registry.last_processed_block);
        // RFC3339 parsing keeps sub-second precision.
        assert_eq!(
            loaded.last_notified_error.map(|t| t.timestamp_micros()),
            registry.last_notified_error.map(|t| t.timestamp_micros())
        );
    }

    #[test]
    fn test_empty_registry_round_trip() {
        let (_dir, store) = open_temp();
        let registry = Registry::new("100".to_string());
        registry.write(&store).unwrap();

        let loaded = Registry::load(&store, "100").unwrap();
        assert_eq!(loaded, registry);
    }

    #[test]
    fn test_load_on_fresh_store_is_empty_v1() {
        let (_dir, store) = open_temp();
        let loaded = Registry::load(&store, "1").unwrap();
        assert_eq!(loaded.version, REGISTRY_VERSION);
        assert_eq!(loaded.num_orders(), 0);
        assert!(loaded.last_processed_block.is_none());
        assert!(loaded.last_notified_error.is_none());
    }

    #[test]
    fn test_write_deletes_cleared_optionals() {
        let (_dir, store) = open_temp();
        let mut registry = Registry::new("1".to_string());
        registry.last_processed_block = Some(RegistryBlock {
            number: 1,
            hash: H256::zero(),
            timestamp: 0,
        });
        registry.last_notified_error = Some(Utc::now());
        registry.write(&store).unwrap();

        registry.last_processed_block = None;
        registry.last_notified_error = None;
        registry.write(&store).unwrap();

        let loaded = Registry::load(&store, "1").unwrap();
        assert!(loaded.last_processed_block.is_none());
        assert!(loaded.last_notified_error.is_none());
    }

    #[test]
    fn test_newer_schema_version_refuses_to_load() {
        let (_dir, store) = open_temp();
        store
            .put(&storage_key(KEY_REGISTRY_VERSION, "1"), b"2")
            .unwrap();
        match Registry::load(&store, "1") {
            Err(WatchError::SchemaVersion { found, expected }) => {
                assert_eq!(found, 2);
                assert_eq!(expected, REGISTRY_VERSION);
            }
            other => panic!("expected schema version error, got {:?}", other),
        }
    }

    #[test]
    fn test_networks_are_isolated() {
        let (_dir, store) = open_temp();
        let mut mainnet = Registry::new("1".to_string());
        mainnet.add(Address::repeat_byte(0xaa), order(0x01, None));
        mainnet.write(&store).unwrap();

        let gnosis = Registry::load(&store, "100").unwrap();
        assert_eq!(gnosis.num_orders(), 0);
    }
}
