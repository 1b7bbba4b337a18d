//! System activity: the append-only audit trail and who gets to see it.
//!
//! Rows are written inside the same transaction as the change they describe
//! and are never rewritten, apart from the admin purge stamp `cleared_at`.
//! Per-viewer dismissals live in their own tree and never touch the row.
//!
//! Visibility is a single [`Predicate`] compiled per viewer by
//! [`visibility_predicate`]; list, count and feed all evaluate that same
//! value, so the endpoints cannot disagree about what a viewer sees.
use crate::clock::Clock;
use crate::error::{PortalError, Result};
use crate::hierarchy::{Ecosystem, RequestScope};
use crate::policy::{OrderAction, OrderStatus};
use crate::store::{self, Store, tx_abort, tx_decode, tx_encode};
use crate::types::{Actor, EntityKind, EntityRef, Role, TimeStamp};
use crate::utils;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderEvent {
    #[n(0)]
    Created,
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
    #[n(3)]
    DeliveryStarted,
    #[n(4)]
    Delivered,
    #[n(5)]
    Completed,
    #[n(6)]
    Cancelled,
    #[n(7)]
    ServiceCreated,
    #[n(8)]
    CrewRequested,
}

impl OrderEvent {
    pub fn from_action(action: OrderAction) -> Option<Self> {
        Some(match action {
            OrderAction::View => return None,
            OrderAction::Accept => OrderEvent::Accepted,
            OrderAction::Reject => OrderEvent::Rejected,
            OrderAction::StartDelivery => OrderEvent::DeliveryStarted,
            OrderAction::Deliver => OrderEvent::Delivered,
            OrderAction::Complete => OrderEvent::Completed,
            OrderAction::Cancel => OrderEvent::Cancelled,
            OrderAction::CreateService => OrderEvent::ServiceCreated,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEvent::Created => "created",
            OrderEvent::Accepted => "accepted",
            OrderEvent::Rejected => "rejected",
            OrderEvent::DeliveryStarted => "delivery_started",
            OrderEvent::Delivered => "delivered",
            OrderEvent::Completed => "completed",
            OrderEvent::Cancelled => "cancelled",
            OrderEvent::ServiceCreated => "service_created",
            OrderEvent::CrewRequested => "crew_requested",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityType {
    #[n(0)]
    Created(#[n(0)] EntityKind),
    #[n(1)]
    AssignedTo {
        #[n(0)]
        subject: EntityKind,
        #[n(1)]
        parent: EntityKind,
    },
    #[n(2)]
    Archived(#[n(0)] EntityKind),
    #[n(3)]
    Restored(#[n(0)] EntityKind),
    #[n(4)]
    HardDeleted(#[n(0)] EntityKind),
    #[n(5)]
    Order(#[n(0)] OrderEvent),
}

impl ActivityType {
    /// Wire name, e.g. `crew_assigned_to_center` or `order_service_created`.
    pub fn name(&self) -> String {
        match self {
            ActivityType::Created(kind) => format!("{kind}_created"),
            ActivityType::AssignedTo { subject, parent } => {
                format!("{subject}_assigned_to_{parent}")
            }
            ActivityType::Archived(kind) => format!("{kind}_archived"),
            ActivityType::Restored(kind) => format!("{kind}_restored"),
            ActivityType::HardDeleted(kind) => format!("{kind}_hard_deleted"),
            ActivityType::Order(event) => format!("order_{}", event.as_str()),
        }
    }

    pub fn category(&self) -> ActivityCategory {
        match self {
            ActivityType::Created(_) => ActivityCategory::Creation,
            ActivityType::AssignedTo { .. } => ActivityCategory::Assignment,
            ActivityType::Archived(_) | ActivityType::Restored(_) | ActivityType::HardDeleted(_) => {
                ActivityCategory::Lifecycle
            }
            ActivityType::Order(_) => ActivityCategory::OrderFlow,
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCategory {
    Creation,
    Assignment,
    /// archive, restore, hard delete
    Lifecycle,
    OrderFlow,
}

/// Who may see an activity of a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityRule {
    pub admin_only: bool,
    /// The viewer is the activity's target (the created entity, the assignee).
    pub self_target: bool,
    /// Target, actor or a typed link falls inside the viewer's ecosystem.
    pub ecosystem: bool,
}

impl ActivityCategory {
    pub const ALL: [ActivityCategory; 4] = [
        ActivityCategory::Creation,
        ActivityCategory::Assignment,
        ActivityCategory::Lifecycle,
        ActivityCategory::OrderFlow,
    ];

    pub fn rule(&self) -> VisibilityRule {
        match self {
            ActivityCategory::Creation | ActivityCategory::Assignment => VisibilityRule {
                admin_only: false,
                self_target: true,
                ecosystem: true,
            },
            ActivityCategory::Lifecycle => VisibilityRule {
                admin_only: true,
                self_target: false,
                ecosystem: false,
            },
            ActivityCategory::OrderFlow => VisibilityRule {
                admin_only: false,
                self_target: false,
                ecosystem: true,
            },
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum ActivityDetail {
    #[n(0)]
    StatusChange {
        /// None for the creation row.
        #[n(0)]
        action: Option<OrderAction>,
        #[n(1)]
        from: Option<OrderStatus>,
        #[n(2)]
        to: OrderStatus,
    },
    #[n(1)]
    Archive {
        #[n(0)]
        reason: Option<String>,
        #[n(1)]
        deletion_scheduled: TimeStamp<Utc>,
    },
    #[n(2)]
    Restore {
        #[n(0)]
        orphaned: u32,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SystemActivity {
    #[n(0)]
    pub activity_id: String,
    #[n(1)]
    pub activity_type: ActivityType,
    #[n(2)]
    pub description: String,
    #[n(3)]
    pub actor_id: String,
    #[n(4)]
    pub actor_role: Role,
    #[n(5)]
    pub target: EntityRef,
    #[n(6)]
    pub links: Vec<EntityRef>,
    #[n(7)]
    pub detail: Option<ActivityDetail>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub cleared_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub cleared_by: Option<String>,
}

impl SystemActivity {
    pub fn new(
        activity_type: ActivityType,
        actor: &Actor,
        target: EntityRef,
        created_at: TimeStamp<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            activity_id: utils::new_uuid_to_bech32("act_")?,
            description: format!("{} {} by {}", activity_type, target.id, actor.user_id),
            activity_type,
            actor_id: actor.user_id.clone(),
            actor_role: actor.role,
            target,
            links: vec![],
            detail: None,
            created_at,
            cleared_at: None,
            cleared_by: None,
        })
    }

    pub fn with_links(mut self, links: Vec<EntityRef>) -> Self {
        for link in links {
            if link != self.target && !self.links.contains(&link) {
                self.links.push(link);
            }
        }
        self
    }

    pub fn with_detail(mut self, detail: ActivityDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared_at.is_some()
    }

    pub fn link(&self, kind: EntityKind) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.kind == kind)
            .map(|l| l.id.as_str())
    }

    /// Time-ordered key in `system_activity`.
    fn storage_key(&self) -> Vec<u8> {
        let mut key = self.created_at.sort_key().to_vec();
        key.extend_from_slice(self.activity_id.as_bytes());
        key
    }
}

/// Append inside a caller's transaction.
pub(crate) fn append_in_tx(
    log: &TransactionalTree,
    index: &TransactionalTree,
    activity: &SystemActivity,
) -> ConflictableTransactionResult<(), PortalError> {
    let key = activity.storage_key();
    log.insert(key.clone(), tx_encode(activity)?)?;
    index.insert(activity.activity_id.as_bytes(), key)?;
    Ok(())
}

/// Composable boolean over a single activity.
#[derive(Debug, Clone)]
pub enum Predicate {
    Always,
    Never,
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Category(ActivityCategory),
    TargetIs(String),
    TargetIn(Arc<Ecosystem>),
    ActorIn(Arc<Ecosystem>),
    LinkIn(Arc<Ecosystem>),
    Cleared,
    DismissedFrom(Arc<HashSet<String>>),
}

impl Predicate {
    pub fn and(self, other: Predicate) -> Predicate {
        match self {
            Predicate::All(mut parts) => {
                parts.push(other);
                Predicate::All(parts)
            }
            first => Predicate::All(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Predicate {
        match self {
            Predicate::Any(mut parts) => {
                parts.push(other);
                Predicate::Any(parts)
            }
            first => Predicate::Any(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }

    /// Target, actor or any typed link inside the ecosystem.
    pub fn touches(ecosystem: Arc<Ecosystem>) -> Predicate {
        Predicate::Any(vec![
            Predicate::TargetIn(Arc::clone(&ecosystem)),
            Predicate::ActorIn(Arc::clone(&ecosystem)),
            Predicate::LinkIn(ecosystem),
        ])
    }

    pub fn matches(&self, a: &SystemActivity) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Never => false,
            Predicate::All(parts) => parts.iter().all(|p| p.matches(a)),
            Predicate::Any(parts) => parts.iter().any(|p| p.matches(a)),
            Predicate::Not(inner) => !inner.matches(a),
            Predicate::Category(c) => a.activity_type.category() == *c,
            Predicate::TargetIs(id) => a.target.id == *id,
            Predicate::TargetIn(eco) => eco.contains(&a.target.id),
            Predicate::ActorIn(eco) => eco.contains(&a.actor_id),
            Predicate::LinkIn(eco) => a.links.iter().any(|l| eco.contains(&l.id)),
            Predicate::Cleared => a.is_cleared(),
            Predicate::DismissedFrom(ids) => ids.contains(&a.activity_id),
        }
    }
}

/// Everything `viewer` is allowed to see, built from the category table.
pub fn visibility_predicate(
    viewer: &Actor,
    ecosystem: Arc<Ecosystem>,
    dismissed: Arc<HashSet<String>>,
) -> Predicate {
    let not_dismissed = Predicate::DismissedFrom(dismissed).not();
    if viewer.is_admin() {
        return not_dismissed;
    }

    let by_category = ActivityCategory::ALL
        .iter()
        .filter_map(|category| {
            let rule = category.rule();
            if rule.admin_only {
                return None;
            }
            let mut reach = vec![];
            if rule.self_target {
                reach.push(Predicate::TargetIs(viewer.user_id.clone()));
            }
            if rule.ecosystem {
                reach.push(Predicate::touches(Arc::clone(&ecosystem)));
            }
            Some(Predicate::Category(*category).and(Predicate::Any(reach)))
        })
        .collect();

    Predicate::Any(by_category)
        .and(Predicate::Cleared.not())
        .and(not_dismissed)
}

#[derive(Clone)]
pub struct ActivityLog {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl ActivityLog {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn get(&self, activity_id: &str) -> Result<SystemActivity> {
        let Some(key) = self.store.activity_index.get(activity_id.as_bytes())? else {
            return Err(PortalError::not_found("activity", activity_id));
        };
        match self.store.activity.get(key)? {
            Some(bytes) => store::decode(&bytes),
            None => Err(PortalError::not_found("activity", activity_id)),
        }
    }

    pub fn dismissed_by(&self, user_id: &str) -> Result<HashSet<String>> {
        let prefix = store::child_prefix(user_id);
        let mut ids = HashSet::new();
        for item in self.store.dismissals.scan_prefix(&prefix) {
            let (key, _) = item?;
            ids.insert(store::key_suffix(&key, prefix.len())?);
        }
        Ok(ids)
    }

    /// Compile the viewer's predicate. Resolves the ecosystem through the
    /// request scope so a request that lists and counts resolves once.
    pub fn visibility(&self, viewer: &Actor, scope: &mut RequestScope<'_>) -> Result<Predicate> {
        let ecosystem = scope.ecosystem_of(viewer)?;
        let dismissed = Arc::new(self.dismissed_by(&viewer.user_id)?);
        Ok(visibility_predicate(viewer, ecosystem, dismissed))
    }

    /// Newest first.
    pub fn select(&self, predicate: &Predicate, limit: Option<usize>) -> Result<Vec<SystemActivity>> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut out = vec![];
        for item in self.store.activity.iter().rev() {
            if out.len() >= limit {
                break;
            }
            let (_, bytes) = item?;
            let activity: SystemActivity = store::decode(&bytes)?;
            if predicate.matches(&activity) {
                out.push(activity);
            }
        }
        Ok(out)
    }

    pub fn tally(&self, predicate: &Predicate) -> Result<usize> {
        let mut n = 0;
        for item in self.store.activity.iter() {
            let (_, bytes) = item?;
            let activity: SystemActivity = store::decode(&bytes)?;
            if predicate.matches(&activity) {
                n += 1;
            }
        }
        Ok(n)
    }

    pub fn list(&self, viewer: &Actor, scope: &mut RequestScope<'_>) -> Result<Vec<SystemActivity>> {
        let predicate = self.visibility(viewer, scope)?;
        self.select(&predicate, None)
    }

    pub fn feed(
        &self,
        viewer: &Actor,
        scope: &mut RequestScope<'_>,
        limit: usize,
    ) -> Result<Vec<SystemActivity>> {
        let predicate = self.visibility(viewer, scope)?;
        self.select(&predicate, Some(limit))
    }

    pub fn count(&self, viewer: &Actor, scope: &mut RequestScope<'_>) -> Result<usize> {
        let predicate = self.visibility(viewer, scope)?;
        self.tally(&predicate)
    }

    /// Hide one activity from one viewer. Dismissing twice is harmless; rows
    /// the viewer cannot see read as missing.
    pub fn dismiss(&self, activity_id: &str, viewer: &Actor, scope: &mut RequestScope<'_>) -> Result<()> {
        let activity = self.get(activity_id)?;
        // ignore earlier dismissals so a repeat still passes
        let visible = visibility_predicate(viewer, scope.ecosystem_of(viewer)?, Arc::new(HashSet::new()));
        if !visible.matches(&activity) {
            warn!(activity = %activity_id, viewer = %viewer.user_id, "dismissal of unseen activity");
            return Err(PortalError::not_found("activity", activity_id));
        }
        let at = self.clock.now();
        self.store.dismissals.insert(
            store::dismissal_key(&viewer.user_id, activity_id),
            store::encode(&at)?,
        )?;
        info!(activity = %activity_id, viewer = %viewer.user_id, "activity dismissed");
        Ok(())
    }

    /// Admin purge: stamps `cleared_at` once; later calls keep the first stamp.
    pub fn clear(&self, activity_id: &str, admin: &Actor) -> Result<SystemActivity> {
        if !admin.is_admin() {
            return Err(PortalError::Forbidden("clearing activity is admin-only".into()));
        }
        let now = self.clock.now();
        let s = &self.store;
        let cleared = (&s.activity, &s.activity_index).transaction(
            |(log, index)| -> ConflictableTransactionResult<SystemActivity, PortalError> {
                let Some(key) = index.get(activity_id.as_bytes())? else {
                    return tx_abort(PortalError::not_found("activity", activity_id));
                };
                let Some(bytes) = log.get(&key)? else {
                    return tx_abort(PortalError::not_found("activity", activity_id));
                };
                let mut activity: SystemActivity = tx_decode(&bytes)?;
                if activity.cleared_at.is_none() {
                    activity.cleared_at = Some(now);
                    activity.cleared_by = Some(admin.user_id.clone());
                    log.insert(key, tx_encode(&activity)?)?;
                }
                Ok(activity)
            },
        )?;
        info!(activity = %activity_id, admin = %admin.user_id, "activity cleared");
        Ok(cleared)
    }
}
