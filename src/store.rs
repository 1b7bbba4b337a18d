//! Persistence layer. Every table is a sled tree holding CBOR records.
//!
//! | tree                   | key                          | value                 |
//! |------------------------|------------------------------|-----------------------|
//! | `entities`             | entity id                    | `Entity`              |
//! | `entity_children`      | owner id `\0` child id       | empty                 |
//! | `orders`               | order id                     | `Order`               |
//! | `order_participants`   | order id                     | `ParticipantLedger`   |
//! | `order_line_items`     | order id                     | `Vec<LineItem>`       |
//! | `system_activity`      | created_at (be) ++ id        | `SystemActivity`      |
//! | `activity_index`       | activity id                  | `system_activity` key |
//! | `activity_dismissals`  | user id `\0` activity id     | dismissed_at          |
//! | `archive_relationships`| kind `:` id                  | `RelationshipGraph`   |
//!
//! Writes that span trees go through `sled::Transactional` so a reader never
//! sees an order without its ledger or activity row.
use crate::error::{PortalError, Result};
use crate::types::EntityKind;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct Store {
    db: Arc<Db>,
    pub(crate) entities: Tree,
    pub(crate) entity_children: Tree,
    pub(crate) orders: Tree,
    pub(crate) participants: Tree,
    pub(crate) line_items: Tree,
    pub(crate) activity: Tree,
    pub(crate) activity_index: Tree,
    pub(crate) dismissals: Tree,
    pub(crate) relationships: Tree,
}

impl Store {
    pub fn new(db: Arc<Db>) -> Result<Self> {
        Ok(Self {
            entities: db.open_tree("entities")?,
            entity_children: db.open_tree("entity_children")?,
            orders: db.open_tree("orders")?,
            participants: db.open_tree("order_participants")?,
            line_items: db.open_tree("order_line_items")?,
            activity: db.open_tree("system_activity")?,
            activity_index: db.open_tree("activity_index")?,
            dismissals: db.open_tree("activity_dismissals")?,
            relationships: db.open_tree("archive_relationships")?,
            db,
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::new(Arc::new(db))
    }

    /// Monotonic across restarts; gaps are possible.
    pub fn next_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

pub(crate) fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T> {
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn tx_encode<T: minicbor::Encode<()>>(
    value: &T,
) -> ConflictableTransactionResult<Vec<u8>, PortalError> {
    encode(value).map_err(ConflictableTransactionError::Abort)
}

pub(crate) fn tx_decode<T: for<'b> minicbor::Decode<'b, ()>>(
    bytes: &[u8],
) -> ConflictableTransactionResult<T, PortalError> {
    decode(bytes).map_err(ConflictableTransactionError::Abort)
}

pub(crate) fn tx_abort<T>(err: PortalError) -> ConflictableTransactionResult<T, PortalError> {
    Err(ConflictableTransactionError::Abort(err))
}

pub(crate) fn child_key(owner_id: &str, child_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner_id.len() + child_id.len() + 1);
    key.extend_from_slice(owner_id.as_bytes());
    key.push(0);
    key.extend_from_slice(child_id.as_bytes());
    key
}

pub(crate) fn child_prefix(owner_id: &str) -> Vec<u8> {
    let mut key = owner_id.as_bytes().to_vec();
    key.push(0);
    key
}

pub(crate) fn dismissal_key(user_id: &str, activity_id: &str) -> Vec<u8> {
    child_key(user_id, activity_id)
}

pub(crate) fn relationship_key(kind: EntityKind, id: &str) -> Vec<u8> {
    format!("{}:{}", kind.as_str(), id).into_bytes()
}

/// Strips the `owner\0` prefix off a child or dismissal key.
pub(crate) fn key_suffix(key: &[u8], prefix_len: usize) -> Result<String> {
    String::from_utf8(key[prefix_len..].to_vec()).map_err(|e| PortalError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_keys_share_owner_prefix() {
        let key = child_key("CEN-010", "CRW-006");
        assert!(key.starts_with(&child_prefix("CEN-010")));
        assert!(!key.starts_with(&child_prefix("CEN-01")));
        assert_eq!(key_suffix(&key, child_prefix("CEN-010").len()).unwrap(), "CRW-006");
    }

    #[test]
    fn relationship_keys_are_kind_scoped() {
        assert_eq!(relationship_key(EntityKind::Center, "CEN-010"), b"center:CEN-010".to_vec());
    }
}
