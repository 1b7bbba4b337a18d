//! Reversible soft delete with a hard-deletion horizon.
//!
//! Archiving stamps the record, snapshots its relationship graph into
//! `archive_relationships` and logs an admin-only activity, all in one
//! transaction. Restore validates the snapshot edge by edge and reports the
//! ones that no longer resolve instead of failing. The sweep removes
//! archived records whose horizon has passed, one transaction per record.
use crate::activity::{self, ActivityDetail, ActivityType, SystemActivity};
use crate::clock::Clock;
use crate::directory::{Directory, Entity};
use crate::error::{PortalError, Result};
use crate::order::{Order, ParticipantLedger};
use crate::store::{self, Store, tx_abort, tx_decode, tx_encode};
use crate::types::{Actor, EntityKind, EntityRef, TimeStamp};
use chrono::Utc;
use serde::Serialize;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveStamp {
    #[n(0)]
    pub archived_at: TimeStamp<Utc>,
    #[n(1)]
    pub archived_by: String,
    #[n(2)]
    pub reason: Option<String>,
    #[n(3)]
    pub deletion_scheduled: TimeStamp<Utc>,
}

impl ArchiveStamp {
    pub fn new(
        archived_at: TimeStamp<Utc>,
        archived_by: impl Into<String>,
        reason: Option<String>,
        retention_days: i64,
    ) -> Self {
        Self {
            archived_at,
            archived_by: archived_by.into(),
            reason,
            deletion_scheduled: archived_at.plus_days(retention_days),
        }
    }

    pub fn is_due(&self, now: TimeStamp<Utc>) -> bool {
        self.deletion_scheduled <= now
    }
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    #[n(0)]
    Owner,
    #[n(1)]
    Child,
    #[n(2)]
    Participant,
    #[n(3)]
    Linked,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationEdge {
    #[n(0)]
    pub kind: RelationKind,
    #[n(1)]
    pub related: EntityRef,
}

/// One node and its kinded edges, as they stood when the node was archived.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct RelationshipGraph {
    #[n(0)]
    pub node: EntityRef,
    #[n(1)]
    pub edges: Vec<RelationEdge>,
    #[n(2)]
    pub captured_at: TimeStamp<Utc>,
}

impl RelationshipGraph {
    pub fn new(node: EntityRef, captured_at: TimeStamp<Utc>) -> Self {
        Self {
            node,
            edges: vec![],
            captured_at,
        }
    }

    pub fn add(&mut self, kind: RelationKind, related: EntityRef) {
        if related == self.node {
            return;
        }
        let edge = RelationEdge { kind, related };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    /// Flat rows in the shape the admin view lists them.
    pub fn rows(&self) -> Vec<ArchiveRelationship> {
        self.edges
            .iter()
            .map(|e| ArchiveRelationship {
                entity_type: self.node.kind,
                entity_id: self.node.id.clone(),
                related_entity_type: e.related.kind,
                related_entity_id: e.related.id.clone(),
                relation_kind: e.kind,
            })
            .collect()
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRelationship {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub related_entity_type: EntityKind,
    pub related_entity_id: String,
    pub relation_kind: RelationKind,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrphanReason {
    Missing,
    Archived,
}

/// A snapshotted edge that no longer resolves. Reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedRelationship {
    pub edge: RelationEdge,
    pub reason: OrphanReason,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub node: EntityRef,
    pub stamp: ArchiveStamp,
    /// False when the record was already archived and nothing was written.
    pub newly_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub node: EntityRef,
    /// False when the record was not archived.
    pub restored: bool,
    pub orphaned: Vec<OrphanedRelationship>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedItem {
    pub node: EntityRef,
    pub name: Option<String>,
    pub stamp: ArchiveStamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    pub node: EntityRef,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: Vec<EntityRef>,
    pub failed: Vec<SweepFailure>,
    /// Picked up by the scan but no longer archived or due when its
    /// transaction ran.
    pub skipped: Vec<EntityRef>,
}

/// Either kind of archivable record, read from whichever tree holds it.
enum Archivable {
    Entity(Entity),
    Order(Order),
}

impl Archivable {
    fn read(
        entities: &TransactionalTree,
        orders: &TransactionalTree,
        node: &EntityRef,
    ) -> ConflictableTransactionResult<Option<Self>, PortalError> {
        if node.kind == EntityKind::Order {
            let Some(bytes) = orders.get(node.id.as_bytes())? else {
                return Ok(None);
            };
            return Ok(Some(Archivable::Order(tx_decode(&bytes)?)));
        }
        let Some(bytes) = entities.get(node.id.as_bytes())? else {
            return Ok(None);
        };
        let entity: Entity = tx_decode(&bytes)?;
        // an id registered under another kind is not this node
        if entity.kind != node.kind {
            return Ok(None);
        }
        Ok(Some(Archivable::Entity(entity)))
    }

    fn write(
        &self,
        entities: &TransactionalTree,
        orders: &TransactionalTree,
    ) -> ConflictableTransactionResult<(), PortalError> {
        match self {
            Archivable::Entity(e) => entities.insert(e.id.as_bytes(), tx_encode(e)?)?,
            Archivable::Order(o) => orders.insert(o.id.as_bytes(), tx_encode(o)?)?,
        };
        Ok(())
    }

    fn stamp(&self) -> Option<&ArchiveStamp> {
        match self {
            Archivable::Entity(e) => e.archive.as_ref(),
            Archivable::Order(o) => o.archive.as_ref(),
        }
    }

    fn set_stamp(&mut self, stamp: Option<ArchiveStamp>) {
        match self {
            Archivable::Entity(e) => e.archive = stamp,
            Archivable::Order(o) => o.archive = stamp,
        }
    }
}

fn require_admin(actor: &Actor, operation: &str) -> Result<()> {
    if actor.is_admin() {
        return Ok(());
    }
    Err(PortalError::Forbidden(format!("{operation} is admin-only")))
}

/// Sweep order: orders first, then the hierarchy from the leaves up, so a
/// parent whose children expire in the same sweep goes after them.
fn sweep_rank(kind: EntityKind) -> u8 {
    match kind {
        EntityKind::Order => 0,
        EntityKind::Service => 1,
        EntityKind::Crew => 2,
        EntityKind::Center => 3,
        EntityKind::Warehouse => 4,
        EntityKind::Customer => 5,
        EntityKind::Contractor => 6,
        EntityKind::Manager => 7,
    }
}

#[derive(Clone)]
pub struct ArchiveService {
    store: Store,
    directory: Directory,
    clock: Arc<dyn Clock>,
    retention_days: i64,
}

impl ArchiveService {
    pub fn new(store: Store, directory: Directory, clock: Arc<dyn Clock>, retention_days: i64) -> Self {
        Self {
            store,
            directory,
            clock,
            retention_days,
        }
    }

    pub fn retention_days(&self) -> i64 {
        self.retention_days
    }

    fn find_order(&self, id: &str) -> Result<Option<Order>> {
        match self.store.orders.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(store::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The node's live edges right now.
    pub fn capture(&self, node: &EntityRef) -> Result<RelationshipGraph> {
        let mut graph = RelationshipGraph::new(node.clone(), self.clock.now());
        if node.kind == EntityKind::Order {
            let order = self
                .find_order(&node.id)?
                .ok_or_else(|| PortalError::not_found("order", &node.id))?;
            if let Some(bytes) = self.store.participants.get(node.id.as_bytes())? {
                let ledger: ParticipantLedger = store::decode(&bytes)?;
                for row in ledger.rows() {
                    if let Some(kind) = row.participant_role.entity_kind() {
                        graph.add(
                            RelationKind::Participant,
                            EntityRef::new(kind, row.participant_id.clone()),
                        );
                    }
                }
            }
            for related in order.related() {
                graph.add(RelationKind::Linked, related);
            }
            return Ok(graph);
        }

        let entity = self
            .directory
            .find(&node.id)?
            .filter(|e| e.kind == node.kind)
            .ok_or_else(|| PortalError::not_found(node.kind.as_str(), &node.id))?;
        if let Some(owner) = entity.owner_ref() {
            graph.add(RelationKind::Owner, owner);
        }
        for child in self.directory.children(&entity.id)? {
            graph.add(RelationKind::Child, child.entity_ref());
        }
        if let Some(order_id) = &entity.source_order {
            graph.add(
                RelationKind::Linked,
                EntityRef::new(EntityKind::Order, order_id.clone()),
            );
        }
        Ok(graph)
    }

    /// Soft delete. Archiving an archived record returns its existing stamp
    /// and writes nothing.
    pub fn archive(
        &self,
        node: &EntityRef,
        reason: Option<String>,
        actor: &Actor,
    ) -> Result<ArchiveOutcome> {
        require_admin(actor, "archive")?;
        let graph = self.capture(node)?;
        let now = self.clock.now();
        let stamp = ArchiveStamp::new(now, actor.user_id.clone(), reason.clone(), self.retention_days);
        let event = SystemActivity::new(ActivityType::Archived(node.kind), actor, node.clone(), now)?
            .with_links(graph.edges.iter().map(|e| e.related.clone()).collect())
            .with_detail(ActivityDetail::Archive {
                reason,
                deletion_scheduled: stamp.deletion_scheduled,
            });

        let s = &self.store;
        let outcome = (&s.entities, &s.orders, &s.relationships, &s.activity, &s.activity_index)
            .transaction(
                |(entities, orders, relationships, log, index)| -> ConflictableTransactionResult<ArchiveOutcome, PortalError> {
                    let Some(mut record) = Archivable::read(entities, orders, node)? else {
                        return tx_abort(PortalError::not_found(node.kind.as_str(), &node.id));
                    };
                    if let Some(existing) = record.stamp() {
                        return Ok(ArchiveOutcome {
                            node: node.clone(),
                            stamp: existing.clone(),
                            newly_archived: false,
                        });
                    }
                    record.set_stamp(Some(stamp.clone()));
                    record.write(entities, orders)?;
                    relationships.insert(
                        store::relationship_key(node.kind, &node.id),
                        tx_encode(&graph)?,
                    )?;
                    activity::append_in_tx(log, index, &event)?;
                    Ok(ArchiveOutcome {
                        node: node.clone(),
                        stamp: stamp.clone(),
                        newly_archived: true,
                    })
                },
            )?;

        if outcome.newly_archived {
            info!(
                node = %node,
                actor = %actor.user_id,
                edges = graph.edges.len(),
                deletion_scheduled = %outcome.stamp.deletion_scheduled,
                "archived"
            );
        }
        Ok(outcome)
    }

    /// Clear the stamp and check every snapshotted edge still resolves.
    pub fn restore(&self, node: &EntityRef, actor: &Actor) -> Result<RestoreOutcome> {
        require_admin(actor, "restore")?;
        let now = self.clock.now();
        let s = &self.store;
        let outcome = (&s.entities, &s.orders, &s.relationships, &s.activity, &s.activity_index)
            .transaction(
                |(entities, orders, relationships, log, index)| -> ConflictableTransactionResult<RestoreOutcome, PortalError> {
                    let Some(mut record) = Archivable::read(entities, orders, node)? else {
                        return tx_abort(PortalError::not_found(node.kind.as_str(), &node.id));
                    };
                    if record.stamp().is_none() {
                        return Ok(RestoreOutcome {
                            node: node.clone(),
                            restored: false,
                            orphaned: vec![],
                        });
                    }

                    let key = store::relationship_key(node.kind, &node.id);
                    let mut orphaned = vec![];
                    if let Some(bytes) = relationships.remove(key)? {
                        let graph: RelationshipGraph = tx_decode(&bytes)?;
                        for edge in graph.edges {
                            let reason = match Archivable::read(entities, orders, &edge.related)? {
                                None => Some(OrphanReason::Missing),
                                Some(r) if r.stamp().is_some() => Some(OrphanReason::Archived),
                                Some(_) => None,
                            };
                            if let Some(reason) = reason {
                                orphaned.push(OrphanedRelationship { edge, reason });
                            }
                        }
                    }

                    record.set_stamp(None);
                    record.write(entities, orders)?;
                    let event = SystemActivity::new(
                        ActivityType::Restored(node.kind),
                        actor,
                        node.clone(),
                        now,
                    )
                    .map_err(sled::transaction::ConflictableTransactionError::Abort)?
                    .with_detail(ActivityDetail::Restore {
                        orphaned: orphaned.len() as u32,
                    });
                    activity::append_in_tx(log, index, &event)?;
                    Ok(RestoreOutcome {
                        node: node.clone(),
                        restored: true,
                        orphaned,
                    })
                },
            )?;

        if outcome.restored {
            info!(node = %node, actor = %actor.user_id, orphaned = outcome.orphaned.len(), "restored");
        }
        for orphan in &outcome.orphaned {
            warn!(node = %node, related = %orphan.edge.related, reason = ?orphan.reason, "orphaned relationship");
        }
        Ok(outcome)
    }

    /// Snapshot held for an archived node, if any.
    pub fn relationships(&self, node: &EntityRef) -> Result<Option<RelationshipGraph>> {
        match self
            .store
            .relationships
            .get(store::relationship_key(node.kind, &node.id))?
        {
            Some(bytes) => Ok(Some(store::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Everything currently archived, optionally of one kind, soonest
    /// deletion first.
    pub fn list_archived(&self, kind: Option<EntityKind>) -> Result<Vec<ArchivedItem>> {
        let mut out = vec![];
        if kind.is_none_or(|k| k != EntityKind::Order) {
            for item in self.store.entities.iter() {
                let (_, bytes) = item?;
                let entity: Entity = store::decode(&bytes)?;
                if kind.is_some_and(|k| k != entity.kind) {
                    continue;
                }
                if let Some(stamp) = entity.archive.clone() {
                    out.push(ArchivedItem {
                        node: entity.entity_ref(),
                        name: Some(entity.name),
                        stamp,
                    });
                }
            }
        }
        if kind.is_none_or(|k| k == EntityKind::Order) {
            for item in self.store.orders.iter() {
                let (_, bytes) = item?;
                let order: Order = store::decode(&bytes)?;
                if let Some(stamp) = order.archive.clone() {
                    out.push(ArchivedItem {
                        node: order.entity_ref(),
                        name: None,
                        stamp,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            a.stamp
                .deletion_scheduled
                .cmp(&b.stamp.deletion_scheduled)
                .then_with(|| a.node.cmp(&b.node))
        });
        Ok(out)
    }

    /// Permanently remove every archived record whose horizon has passed.
    /// Each record is its own transaction; a failure leaves that record
    /// archived for the next run and does not stop the batch.
    pub fn hard_delete_sweep(&self, actor: &Actor) -> Result<SweepReport> {
        require_admin(actor, "hard delete sweep")?;
        let now = self.clock.now();
        let mut due: Vec<EntityRef> = self
            .list_archived(None)?
            .into_iter()
            .filter(|item| item.stamp.is_due(now))
            .map(|item| item.node)
            .collect();
        due.sort_by_key(|node| sweep_rank(node.kind));

        let mut report = SweepReport::default();
        for node in due {
            match self.hard_delete(&node, actor, now) {
                Ok(true) => report.deleted.push(node),
                Ok(false) => report.skipped.push(node),
                Err(e) => {
                    warn!(node = %node, error = %e, "hard delete failed, left for next sweep");
                    report.failed.push(SweepFailure {
                        node,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "hard delete sweep finished"
        );
        Ok(report)
    }

    /// Delete one record and its dependents if it is still archived and due.
    /// Returns false when there was nothing to do.
    pub fn hard_delete(&self, node: &EntityRef, actor: &Actor, now: TimeStamp<Utc>) -> Result<bool> {
        let event = SystemActivity::new(ActivityType::HardDeleted(node.kind), actor, node.clone(), now)?;
        if node.kind == EntityKind::Order {
            return self.hard_delete_order(node, &event, now);
        }

        if self.directory.has_children(&node.id)? {
            return Err(PortalError::DependentDeleteFailure {
                kind: node.kind.as_str(),
                id: node.id.clone(),
                reason: "child entities still point at it".into(),
            });
        }

        let s = &self.store;
        let deleted = (
            &s.entities,
            &s.orders,
            &s.entity_children,
            &s.relationships,
            &s.activity,
            &s.activity_index,
        )
            .transaction(
                |(entities, orders, children, relationships, log, index)| -> ConflictableTransactionResult<bool, PortalError> {
                    let Some(Archivable::Entity(entity)) = Archivable::read(entities, orders, node)? else {
                        return Ok(false);
                    };
                    if !entity.archive.as_ref().is_some_and(|stamp| stamp.is_due(now)) {
                        return Ok(false);
                    }
                    if let Some(owner) = &entity.owner {
                        children.remove(store::child_key(owner, &entity.id))?;
                    }
                    entities.remove(entity.id.as_bytes())?;
                    relationships.remove(store::relationship_key(node.kind, &node.id))?;
                    activity::append_in_tx(log, index, &event)?;
                    Ok(true)
                },
            )?;

        if deleted {
            info!(node = %node, actor = %actor.user_id, "hard deleted");
        }
        Ok(deleted)
    }

    fn hard_delete_order(&self, node: &EntityRef, event: &SystemActivity, now: TimeStamp<Utc>) -> Result<bool> {
        let s = &self.store;
        let deleted = (
            &s.orders,
            &s.participants,
            &s.line_items,
            &s.relationships,
            &s.activity,
            &s.activity_index,
        )
            .transaction(
                |(orders, participants, line_items, relationships, log, index)| -> ConflictableTransactionResult<bool, PortalError> {
                    let Some(bytes) = orders.get(node.id.as_bytes())? else {
                        return Ok(false);
                    };
                    let order: Order = tx_decode(&bytes)?;
                    if !order.archive.as_ref().is_some_and(|stamp| stamp.is_due(now)) {
                        return Ok(false);
                    }
                    // dependents before the parent
                    participants.remove(node.id.as_bytes())?;
                    line_items.remove(node.id.as_bytes())?;
                    relationships.remove(store::relationship_key(node.kind, &node.id))?;
                    orders.remove(node.id.as_bytes())?;
                    activity::append_in_tx(log, index, event)?;
                    Ok(true)
                },
            )?;

        if deleted {
            info!(node = %node, actor = %event.actor_id, "hard deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_is_scheduled_from_archive_time() {
        let at = TimeStamp::new_with(2025, 3, 1, 12, 0, 0);
        let stamp = ArchiveStamp::new(at, "ADMIN-001", None, DEFAULT_RETENTION_DAYS);

        assert_eq!(stamp.deletion_scheduled, TimeStamp::new_with(2025, 3, 31, 12, 0, 0));
        assert!(!stamp.is_due(at.plus_days(29)));
        assert!(stamp.is_due(at.plus_days(30)));
    }

    #[test]
    fn graph_skips_self_and_duplicate_edges() {
        let node = EntityRef::new(EntityKind::Center, "CEN-010");
        let mut graph = RelationshipGraph::new(node.clone(), TimeStamp::new());
        graph.add(RelationKind::Owner, EntityRef::new(EntityKind::Customer, "CUS-001"));
        graph.add(RelationKind::Owner, EntityRef::new(EntityKind::Customer, "CUS-001"));
        graph.add(RelationKind::Linked, node);
        graph.add(RelationKind::Child, EntityRef::new(EntityKind::Crew, "CRW-006"));

        let rows = graph.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].relation_kind, RelationKind::Owner);
        assert_eq!(rows[1].related_entity_id, "CRW-006");
    }

    #[test]
    fn leaves_are_swept_before_parents() {
        let mut kinds = vec![EntityKind::Manager, EntityKind::Crew, EntityKind::Order, EntityKind::Center];
        kinds.sort_by_key(|k| sweep_rank(*k));
        assert_eq!(
            kinds,
            vec![EntityKind::Order, EntityKind::Crew, EntityKind::Center, EntityKind::Manager]
        );
    }
}
