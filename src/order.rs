//! Order records, the participant ledger and line items.
use crate::archive::ArchiveStamp;
use crate::policy::{OrderStatus, OrderType, Participation};
use crate::types::{EntityKind, EntityRef, Role, TimeStamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationType {
    #[n(0)]
    Creator,
    #[n(1)]
    Actor,
    #[n(2)]
    Watcher,
    #[n(3)]
    Destination,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct OrderParticipant {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    pub participant_id: String,
    #[n(2)]
    pub participant_role: Role,
    #[n(3)]
    pub participation_type: ParticipationType,
    #[n(4)]
    pub added_at: TimeStamp<Utc>,
}

/// Append-only list of everyone recorded against one order.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Default)]
pub struct ParticipantLedger {
    #[n(0)]
    pub order_id: String,
    #[n(1)]
    rows: Vec<OrderParticipant>,
}

impl ParticipantLedger {
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            rows: vec![],
        }
    }

    pub fn rows(&self) -> &[OrderParticipant] {
        &self.rows
    }

    pub fn contains(&self, participant_id: &str, participation_type: ParticipationType) -> bool {
        self.rows.iter().any(|r| {
            r.participant_id == participant_id && r.participation_type == participation_type
        })
    }

    /// Returns false when the participant already holds that participation type.
    pub fn append(
        &mut self,
        participant_id: &str,
        participant_role: Role,
        participation_type: ParticipationType,
        added_at: TimeStamp<Utc>,
    ) -> bool {
        if self.contains(participant_id, participation_type) {
            return false;
        }
        self.rows.push(OrderParticipant {
            order_id: self.order_id.clone(),
            participant_id: participant_id.to_string(),
            participant_role,
            participation_type,
            added_at,
        });
        true
    }

    pub fn participation_for(&self, participant_id: &str) -> Participation {
        Participation {
            is_creator: self.contains(participant_id, ParticipationType::Creator),
            is_assigned_actor: self.contains(participant_id, ParticipationType::Actor)
                || self.contains(participant_id, ParticipationType::Destination),
        }
    }

    pub fn is_listed(&self, participant_id: &str) -> bool {
        self.rows.iter().any(|r| r.participant_id == participant_id)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    #[n(0)]
    pub catalog_code: String,
    #[n(1)]
    pub quantity: u32,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Order {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub order_type: OrderType,
    #[n(2)]
    pub status: OrderStatus,
    #[n(3)]
    pub creator_id: String,
    #[n(4)]
    pub creator_role: Role,
    #[n(5)]
    pub destination_id: String,
    #[n(6)]
    pub destination_role: Role,
    #[n(7)]
    pub next_actor_role: Option<Role>,
    #[n(8)]
    pub requested_date: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub links: Vec<EntityRef>,
    #[n(10)]
    pub created_at: TimeStamp<Utc>,
    #[n(11)]
    pub updated_at: TimeStamp<Utc>,
    #[n(12)]
    pub archive: Option<ArchiveStamp>,
}

impl Order {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(EntityKind::Order, self.id.clone())
    }

    pub fn link(&self, kind: EntityKind) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.kind == kind)
            .map(|l| l.id.as_str())
    }

    /// One link per kind; a new link of an existing kind replaces it.
    pub fn set_link(&mut self, link: EntityRef) {
        self.links.retain(|l| l.kind != link.kind);
        self.links.push(link);
    }

    pub fn is_archived(&self) -> bool {
        self.archive.is_some()
    }

    /// Every entity this order points at: creator, destination and typed links.
    pub fn related(&self) -> Vec<EntityRef> {
        let mut related = Vec::with_capacity(self.links.len() + 2);
        if let Some(kind) = self.creator_role.entity_kind() {
            related.push(EntityRef::new(kind, self.creator_id.clone()));
        }
        if let Some(kind) = self.destination_role.entity_kind() {
            related.push(EntityRef::new(kind, self.destination_id.clone()));
        }
        for link in &self.links {
            if !related.contains(link) {
                related.push(link.clone());
            }
        }
        related
    }
}

/// What a caller supplies to open an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDraft {
    pub order_type: OrderType,
    pub destination_id: String,
    pub requested_date: Option<TimeStamp<Utc>>,
    /// Crew requested for a service order, if the creator already knows it.
    pub crew_id: Option<String>,
    pub items: Vec<LineItem>,
}

impl OrderDraft {
    pub fn product(destination_id: impl Into<String>, items: Vec<LineItem>) -> Self {
        Self {
            order_type: OrderType::Product,
            destination_id: destination_id.into(),
            requested_date: None,
            crew_id: None,
            items,
        }
    }

    pub fn service(destination_id: impl Into<String>) -> Self {
        Self {
            order_type: OrderType::Service,
            destination_id: destination_id.into(),
            requested_date: None,
            crew_id: None,
            items: vec![],
        }
    }

    pub fn with_crew(mut self, crew_id: impl Into<String>) -> Self {
        self.crew_id = Some(crew_id.into());
        self
    }

    pub fn with_requested_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.requested_date = Some(date);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_rejects_duplicate_participation() {
        let now = TimeStamp::new();
        let mut ledger = ParticipantLedger::new("PRD-0001");

        assert!(ledger.append("WH-001", Role::Warehouse, ParticipationType::Destination, now));
        assert!(!ledger.append("WH-001", Role::Warehouse, ParticipationType::Destination, now));
        assert!(ledger.append("WH-001", Role::Warehouse, ParticipationType::Actor, now));
        assert_eq!(ledger.rows().len(), 2);
    }

    #[test]
    fn participation_reads_the_ledger() {
        let now = TimeStamp::new();
        let mut ledger = ParticipantLedger::new("SRV-0001");
        ledger.append("CEN-001", Role::Center, ParticipationType::Creator, now);
        ledger.append("CUS-001", Role::Customer, ParticipationType::Actor, now);
        ledger.append("MGR-001", Role::Manager, ParticipationType::Watcher, now);

        assert_eq!(ledger.participation_for("CEN-001"), Participation::new(true, false));
        assert_eq!(ledger.participation_for("CUS-001"), Participation::new(false, true));
        assert_eq!(ledger.participation_for("MGR-001"), Participation::new(false, false));
        assert!(ledger.is_listed("MGR-001"));
    }

    #[test]
    fn ledger_cbor_roundtrip() {
        let mut ledger = ParticipantLedger::new("SRV-0002");
        ledger.append("CRW-001", Role::Crew, ParticipationType::Actor, TimeStamp::new());

        let encoded = minicbor::to_vec(&ledger).unwrap();
        let decoded: ParticipantLedger = minicbor::decode(&encoded).unwrap();

        assert_eq!(ledger, decoded);
    }
}
