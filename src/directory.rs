//! Directory of hierarchy entities: managers down to crew, warehouses, services.
//!
//! Each entity carries a single owner link whose kind is fixed by
//! [`EntityKind::owner_kind`]. A reverse index (`entity_children`) lets the
//! hierarchy resolver walk downwards without scanning the whole tree.
use crate::activity::{self, ActivityType, SystemActivity};
use crate::archive::ArchiveStamp;
use crate::clock::Clock;
use crate::error::{PortalError, Result};
use crate::store::{self, Store, tx_abort, tx_decode, tx_encode};
use crate::types::{Actor, EntityKind, EntityRef, TimeStamp};
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::sync::Arc;
use tracing::info;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub kind: EntityKind,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub owner: Option<String>,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub archive: Option<ArchiveStamp>,
    /// Set on services spun up by an order.
    #[n(6)]
    pub source_order: Option<String>,
}

impl Entity {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.kind, self.id.clone())
    }

    pub fn owner_ref(&self) -> Option<EntityRef> {
        let kind = self.kind.owner_kind()?;
        self.owner.as_ref().map(|id| EntityRef::new(kind, id.clone()))
    }

    pub fn is_archived(&self) -> bool {
        self.archive.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDraft {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    pub owner: Option<String>,
}

impl EntityDraft {
    pub fn new(kind: EntityKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            owner: None,
        }
    }

    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[derive(Clone)]
pub struct Directory {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl Directory {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn find(&self, id: &str) -> Result<Option<Entity>> {
        match self.store.entities.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(store::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &str) -> Result<Entity> {
        self.find(id)?
            .ok_or_else(|| PortalError::not_found("entity", id))
    }

    /// Entities of one kind. Archived entities only show up when asked for.
    pub fn list(&self, kind: EntityKind, include_archived: bool) -> Result<Vec<Entity>> {
        let mut out = vec![];
        for item in self.store.entities.iter() {
            let (_, bytes) = item?;
            let entity: Entity = store::decode(&bytes)?;
            if entity.kind == kind && (include_archived || !entity.is_archived()) {
                out.push(entity);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Direct children, archived or not.
    pub fn children(&self, owner_id: &str) -> Result<Vec<Entity>> {
        let prefix = store::child_prefix(owner_id);
        let mut out = vec![];
        for item in self.store.entity_children.scan_prefix(&prefix) {
            let (key, _) = item?;
            let child_id = store::key_suffix(&key, prefix.len())?;
            if let Some(child) = self.find(&child_id)? {
                out.push(child);
            }
        }
        Ok(out)
    }

    pub fn has_children(&self, owner_id: &str) -> Result<bool> {
        Ok(self
            .store
            .entity_children
            .scan_prefix(store::child_prefix(owner_id))
            .next()
            .transpose()?
            .is_some())
    }

    fn check_owner(&self, kind: EntityKind, owner_id: &str) -> Result<Entity> {
        let owner = self.get(owner_id)?;
        if Some(owner.kind) != kind.owner_kind() {
            return Err(PortalError::InvalidInput(format!(
                "a {kind} cannot be owned by {} '{}'",
                owner.kind, owner.id
            )));
        }
        Ok(owner)
    }

    /// Store a new entity and record `<kind>_created` against it.
    pub fn register(&self, draft: EntityDraft, actor: &Actor) -> Result<Entity> {
        if draft.kind == EntityKind::Order {
            return Err(PortalError::InvalidInput(
                "orders are opened through the order service".into(),
            ));
        }
        if draft.id.trim().is_empty() {
            return Err(PortalError::InvalidInput("entity id is empty".into()));
        }
        let owner = match &draft.owner {
            Some(owner_id) => Some(self.check_owner(draft.kind, owner_id)?),
            None => None,
        };

        let now = self.clock.now();
        let entity = Entity {
            id: draft.id,
            kind: draft.kind,
            name: draft.name,
            owner: owner.as_ref().map(|o| o.id.clone()),
            created_at: now,
            archive: None,
            source_order: None,
        };
        let event = SystemActivity::new(
            ActivityType::Created(entity.kind),
            actor,
            entity.entity_ref(),
            now,
        )?
        .with_links(owner.iter().map(Entity::entity_ref).collect());

        let s = &self.store;
        (&s.entities, &s.entity_children, &s.activity, &s.activity_index).transaction(
            |(entities, children, log, index)| -> ConflictableTransactionResult<(), PortalError> {
                if entities.get(entity.id.as_bytes())?.is_some() {
                    return tx_abort(PortalError::InvalidInput(format!(
                        "entity '{}' already exists",
                        entity.id
                    )));
                }
                insert_entity_in_tx(entities, children, &entity)?;
                activity::append_in_tx(log, index, &event)?;
                Ok(())
            },
        )?;

        info!(entity = %entity.id, kind = %entity.kind, actor = %actor.user_id, "entity registered");
        Ok(entity)
    }

    /// Point `child_id` at a new owner and record `<child>_assigned_to_<owner>`.
    /// Re-assigning to the current owner changes nothing.
    pub fn assign(&self, child_id: &str, owner_id: &str, actor: &Actor) -> Result<Entity> {
        let child = self.get(child_id)?;
        let owner = self.check_owner(child.kind, owner_id)?;
        if child.owner.as_deref() == Some(owner_id) {
            return Ok(child);
        }

        let now = self.clock.now();
        let event = SystemActivity::new(
            ActivityType::AssignedTo {
                subject: child.kind,
                parent: owner.kind,
            },
            actor,
            child.entity_ref(),
            now,
        )?
        .with_links(vec![owner.entity_ref()]);

        let s = &self.store;
        let updated = (&s.entities, &s.entity_children, &s.activity, &s.activity_index)
            .transaction(
                |(entities, children, log, index)| -> ConflictableTransactionResult<Entity, PortalError> {
                    let Some(bytes) = entities.get(child_id.as_bytes())? else {
                        return tx_abort(PortalError::not_found("entity", child_id));
                    };
                    let mut current: Entity = tx_decode(&bytes)?;
                    if let Some(previous) = &current.owner {
                        children.remove(store::child_key(previous, &current.id))?;
                    }
                    current.owner = Some(owner_id.to_string());
                    insert_entity_in_tx(entities, children, &current)?;
                    activity::append_in_tx(log, index, &event)?;
                    Ok(current)
                },
            )?;

        info!(entity = %child_id, owner = %owner_id, actor = %actor.user_id, "entity assigned");
        Ok(updated)
    }
}

/// Write the entity and its entry in the owner's child index.
pub(crate) fn insert_entity_in_tx(
    entities: &TransactionalTree,
    children: &TransactionalTree,
    entity: &Entity,
) -> ConflictableTransactionResult<(), PortalError> {
    entities.insert(entity.id.as_bytes(), tx_encode(entity)?)?;
    if let Some(owner) = &entity.owner {
        children.insert(store::child_key(owner, &entity.id), &[] as &[u8])?;
    }
    Ok(())
}
