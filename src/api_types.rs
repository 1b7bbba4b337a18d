//! Request and response bodies for the HTTP surface.
use crate::activity::{ActivityCategory, SystemActivity};
use crate::archive::{
    ArchiveOutcome, ArchivedItem, OrphanReason, RelationKind, RestoreOutcome, SweepReport,
};
use crate::executor::OrderState;
use crate::order::{LineItem, Order, OrderParticipant, ParticipationType};
use crate::policy::{OrderAction, OrderStatus, OrderType};
use crate::types::{EntityKind, EntityRef, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantBody {
    pub participant_id: String,
    pub participant_role: Role,
    pub participation_type: ParticipationType,
    pub added_at: DateTime<Utc>,
}

impl From<&OrderParticipant> for ParticipantBody {
    fn from(p: &OrderParticipant) -> Self {
        Self {
            participant_id: p.participant_id.clone(),
            participant_role: p.participant_role,
            participation_type: p.participation_type,
            added_at: p.added_at.to_datetime_utc(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub status_label: &'static str,
    pub next_actor_role: Option<Role>,
    pub creator_id: String,
    pub destination_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderSummary {
    fn from(o: &Order) -> Self {
        Self {
            id: o.id.clone(),
            order_type: o.order_type,
            status: o.status,
            status_label: o.status.label(),
            next_actor_role: o.next_actor_role,
            creator_id: o.creator_id.clone(),
            destination_id: o.destination_id.clone(),
            created_at: o.created_at.to_datetime_utc(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub status_label: &'static str,
    pub next_actor_role: Option<Role>,
    pub creator_id: String,
    pub creator_role: Role,
    pub destination_id: String,
    pub destination_role: Role,
    pub requested_date: Option<DateTime<Utc>>,
    pub links: Vec<EntityRef>,
    pub archived: bool,
    pub participants: Vec<ParticipantBody>,
    pub allowed_actions: Vec<OrderAction>,
    pub policy_version: u32,
    pub created_service: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderState> for OrderResponse {
    fn from(state: OrderState) -> Self {
        let OrderState {
            order,
            participants,
            allowed_actions,
            policy_version,
            created_service,
        } = state;
        Self {
            status_label: order.status.label(),
            archived: order.is_archived(),
            requested_date: order.requested_date.map(|d| d.to_datetime_utc()),
            updated_at: order.updated_at.to_datetime_utc(),
            id: order.id,
            order_type: order.order_type,
            status: order.status,
            next_actor_role: order.next_actor_role,
            creator_id: order.creator_id,
            creator_role: order.creator_role,
            destination_id: order.destination_id,
            destination_role: order.destination_role,
            links: order.links,
            participants: participants.iter().map(ParticipantBody::from).collect(),
            allowed_actions,
            policy_version: policy_version.0,
            created_service: created_service.map(|s| s.id),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub order_type: OrderType,
    pub destination_id: String,
    #[serde(default)]
    pub requested_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub crew_id: Option<String>,
    #[serde(default)]
    pub items: Vec<LineItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionBody {
    pub policy_version: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCrewBody {
    pub crew_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivityQuery {
    pub scope: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBody {
    pub activity_id: String,
    pub activity_type: String,
    pub category: ActivityCategory,
    pub description: String,
    pub actor_id: String,
    pub actor_role: Role,
    pub target_type: EntityKind,
    pub target_id: String,
    pub links: Vec<EntityRef>,
    pub created_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}

impl From<SystemActivity> for ActivityBody {
    fn from(a: SystemActivity) -> Self {
        Self {
            activity_type: a.activity_type.name(),
            category: a.activity_type.category(),
            created_at: a.created_at.to_datetime_utc(),
            cleared_at: a.cleared_at.map(|t| t.to_datetime_utc()),
            activity_id: a.activity_id,
            description: a.description,
            actor_id: a.actor_id,
            actor_role: a.actor_role,
            target_type: a.target.kind,
            target_id: a.target.id,
            links: a.links,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CountResponse {
    pub count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRequest {
    pub entity_type: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub entity_type: EntityKind,
    pub entity_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveResponse {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub archived_at: DateTime<Utc>,
    pub archived_by: String,
    pub archive_reason: Option<String>,
    pub deletion_scheduled: DateTime<Utc>,
    pub newly_archived: bool,
}

impl From<ArchiveOutcome> for ArchiveResponse {
    fn from(o: ArchiveOutcome) -> Self {
        Self {
            entity_type: o.node.kind,
            entity_id: o.node.id,
            archived_at: o.stamp.archived_at.to_datetime_utc(),
            archived_by: o.stamp.archived_by,
            archive_reason: o.stamp.reason,
            deletion_scheduled: o.stamp.deletion_scheduled.to_datetime_utc(),
            newly_archived: o.newly_archived,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanBody {
    pub related_entity_type: EntityKind,
    pub related_entity_id: String,
    pub relation_kind: RelationKind,
    pub reason: OrphanReason,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub restored: bool,
    pub orphaned_relationships: Vec<OrphanBody>,
}

impl From<RestoreOutcome> for RestoreResponse {
    fn from(o: RestoreOutcome) -> Self {
        Self {
            entity_type: o.node.kind,
            entity_id: o.node.id,
            restored: o.restored,
            orphaned_relationships: o
                .orphaned
                .into_iter()
                .map(|orphan| OrphanBody {
                    related_entity_type: orphan.edge.related.kind,
                    related_entity_id: orphan.edge.related.id,
                    relation_kind: orphan.edge.kind,
                    reason: orphan.reason,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveListQuery {
    pub entity_type: Option<EntityKind>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedBody {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub name: Option<String>,
    pub archived_at: DateTime<Utc>,
    pub archived_by: String,
    pub deletion_scheduled: DateTime<Utc>,
}

impl From<ArchivedItem> for ArchivedBody {
    fn from(item: ArchivedItem) -> Self {
        Self {
            entity_type: item.node.kind,
            entity_id: item.node.id,
            name: item.name,
            archived_at: item.stamp.archived_at.to_datetime_utc(),
            archived_by: item.stamp.archived_by,
            deletion_scheduled: item.stamp.deletion_scheduled.to_datetime_utc(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResponse {
    pub deleted: Vec<EntityRef>,
    pub failed: usize,
    pub skipped: Vec<EntityRef>,
}

impl From<SweepReport> for SweepResponse {
    fn from(report: SweepReport) -> Self {
        // failure reasons stay in the logs
        Self {
            deleted: report.deleted,
            failed: report.failed.len(),
            skipped: report.skipped,
        }
    }
}
