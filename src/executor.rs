//! Transition executor: opens orders and applies policy-approved actions.
//!
//! Every write is one sled transaction over the order, its participant
//! ledger, any derived entity and the activity row. The status write is a
//! compare-and-set against the status the caller's decision was made on.
use crate::activity::{self, ActivityDetail, ActivityType, OrderEvent, SystemActivity};
use crate::clock::Clock;
use crate::directory::{self, Entity};
use crate::error::{PortalError, Result};
use crate::hierarchy::{HierarchyResolver, RequestScope};
use crate::order::{
    LineItem, Order, OrderDraft, OrderParticipant, ParticipantLedger, ParticipationType,
};
use crate::policy::{self, Decision, OrderAction, OrderStatus, OrderType, PolicyVersion, SideEffect};
use crate::store::{self, Store, tx_abort, tx_decode, tx_encode};
use crate::types::{Actor, EntityKind, Role};
use crate::utils;
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub order_id: String,
    pub actor: Actor,
    pub action: OrderAction,
    /// Version the caller computed its action menu from.
    pub policy_version: PolicyVersion,
}

impl ActionRequest {
    pub fn new(order_id: impl Into<String>, actor: Actor, action: OrderAction) -> Self {
        Self {
            order_id: order_id.into(),
            actor,
            action,
            policy_version: PolicyVersion::CURRENT,
        }
    }

    pub fn at_version(mut self, version: PolicyVersion) -> Self {
        self.policy_version = version;
        self
    }
}

/// An order and its ledger as read at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSnapshot {
    pub order: Order,
    pub ledger: ParticipantLedger,
}

/// What a caller gets back: the order, who is on it and what they may do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderState {
    pub order: Order,
    pub participants: Vec<OrderParticipant>,
    pub allowed_actions: Vec<OrderAction>,
    pub policy_version: PolicyVersion,
    /// Set when this call created a linked service.
    pub created_service: Option<Entity>,
}

impl OrderState {
    fn for_caller(snapshot: OrderSnapshot, actor: &Actor) -> Self {
        let OrderSnapshot { order, ledger } = snapshot;
        let participation = ledger.participation_for(&actor.user_id);
        let mut allowed_actions = policy::get_allowed_actions(
            actor.role,
            order.order_type,
            order.status,
            participation.is_creator,
            participation.is_assigned_actor,
        );
        if order.is_archived() {
            allowed_actions.retain(OrderAction::is_read_only);
        }
        Self {
            order,
            participants: ledger.rows().to_vec(),
            allowed_actions,
            policy_version: PolicyVersion::CURRENT,
            created_service: None,
        }
    }
}

#[derive(Clone)]
pub struct OrderService {
    store: Store,
    resolver: HierarchyResolver,
    clock: Arc<dyn Clock>,
}

impl OrderService {
    pub fn new(store: Store, resolver: HierarchyResolver, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            resolver,
            clock,
        }
    }

    fn mint_code(&self, prefix: &str) -> Result<String> {
        Ok(utils::sequence_code(prefix, self.store.next_id()? + 1))
    }

    fn active_entity(&self, id: &str, kind: EntityKind) -> Result<Entity> {
        match self.resolver.directory().find(id)? {
            Some(e) if e.kind == kind && !e.is_archived() => Ok(e),
            _ => Err(PortalError::not_found(kind.as_str(), id)),
        }
    }

    /// Whether `target` lies inside what `actor` may address. A warehouse
    /// linked to a contractor serves that contractor's line; an unlinked
    /// warehouse serves everyone.
    fn within_reach(&self, actor: &Actor, target: &Entity, scope: &mut RequestScope<'_>) -> Result<bool> {
        if actor.is_admin() {
            return Ok(true);
        }
        let ecosystem = scope.ecosystem_of(actor)?;
        if ecosystem.contains(&target.id) {
            return Ok(true);
        }
        if target.kind != EntityKind::Warehouse {
            return Ok(false);
        }
        let Some(contractor) = &target.owner else {
            return Ok(true);
        };
        if ecosystem.contains(contractor) {
            return Ok(true);
        }
        Ok(self
            .resolver
            .ancestors(&actor.user_id)?
            .iter()
            .any(|a| &a.id == contractor))
    }

    /// Open a new order. The order, its line items, its ledger and the
    /// `order_created` row land together or not at all.
    pub fn create_order(&self, draft: OrderDraft, creator: &Actor) -> Result<OrderState> {
        let Some(creator_kind) = creator.role.entity_kind() else {
            return Err(PortalError::InvalidTransition(format!(
                "role '{}' cannot create orders",
                creator.role
            )));
        };
        if !policy::can_create(creator.role, draft.order_type) {
            return Err(PortalError::InvalidTransition(format!(
                "role '{}' cannot create {} orders",
                creator.role, draft.order_type
            )));
        }
        self.active_entity(&creator.user_id, creator_kind)?;

        let destination = self
            .resolver
            .directory()
            .find(&draft.destination_id)?
            .filter(|e| !e.is_archived())
            .ok_or_else(|| PortalError::not_found("destination", &draft.destination_id))?;
        let mut scope = self.resolver.scope();
        if !self.within_reach(creator, &destination, &mut scope)? {
            warn!(destination = %destination.id, actor = %creator.user_id, "destination outside creator's reach");
            return Err(PortalError::not_found("destination", &draft.destination_id));
        }
        let destination_role = match (draft.order_type, destination.kind) {
            (OrderType::Product, EntityKind::Warehouse) => Role::Warehouse,
            (OrderType::Service, EntityKind::Center) => Role::Center,
            (OrderType::Service, EntityKind::Warehouse) => Role::Warehouse,
            (order_type, kind) => {
                return Err(PortalError::InvalidInput(format!(
                    "a {order_type} order cannot be sent to a {kind}"
                )));
            }
        };
        if draft.order_type == OrderType::Product
            && (draft.items.is_empty() || draft.items.iter().any(|i| i.quantity == 0))
        {
            return Err(PortalError::InvalidInput(
                "product orders need at least one line item with a quantity".into(),
            ));
        }
        let status = policy::initial_status(draft.order_type, creator.role, destination_role)
            .ok_or_else(|| {
                PortalError::InvalidTransition(format!(
                    "no starting status for a {} order from {} to {}",
                    draft.order_type, creator.role, destination_role
                ))
            })?;
        let crew = match &draft.crew_id {
            Some(crew_id) if draft.order_type == OrderType::Service => {
                let crew = self.active_entity(crew_id, EntityKind::Crew)?;
                if !self.within_reach(creator, &crew, &mut scope)? {
                    return Err(PortalError::not_found("crew", crew_id));
                }
                Some(crew)
            }
            Some(_) => {
                return Err(PortalError::InvalidInput(
                    "crew can only be requested on service orders".into(),
                ));
            }
            None => None,
        };

        let now = self.clock.now();
        let order_id = self.mint_code(draft.order_type.code_prefix())?;
        let mut order = Order {
            id: order_id.clone(),
            order_type: draft.order_type,
            status,
            creator_id: creator.user_id.clone(),
            creator_role: creator.role,
            destination_id: destination.id.clone(),
            destination_role,
            next_actor_role: policy::next_actor_role(draft.order_type, status),
            requested_date: draft.requested_date,
            links: vec![],
            created_at: now,
            updated_at: now,
            archive: None,
        };
        if destination.kind == EntityKind::Center {
            order.set_link(destination.entity_ref());
        }
        if let Some(crew) = &crew {
            order.set_link(crew.entity_ref());
        }

        let mut ledger = ParticipantLedger::new(order_id.clone());
        ledger.append(&creator.user_id, creator.role, ParticipationType::Creator, now);
        ledger.append(&destination.id, destination_role, ParticipationType::Destination, now);
        // approvers above the destination act on service orders and watch product ones
        let chain_type = match draft.order_type {
            OrderType::Service => ParticipationType::Actor,
            OrderType::Product => ParticipationType::Watcher,
        };
        for ancestor in self.resolver.ancestors(&destination.id)? {
            if let Some(role) = ancestor.kind.role() {
                ledger.append(&ancestor.id, role, chain_type, now);
            }
        }
        for ancestor in self.resolver.ancestors(&creator.user_id)? {
            if ledger.is_listed(&ancestor.id) {
                continue;
            }
            if let Some(role) = ancestor.kind.role() {
                ledger.append(&ancestor.id, role, ParticipationType::Watcher, now);
            }
        }
        if let Some(crew) = &crew {
            ledger.append(&crew.id, Role::Crew, ParticipationType::Actor, now);
        }

        let event = SystemActivity::new(
            ActivityType::Order(OrderEvent::Created),
            creator,
            order.entity_ref(),
            now,
        )?
        .with_links(order.related())
        .with_detail(ActivityDetail::StatusChange {
            action: None,
            from: None,
            to: status,
        });

        let s = &self.store;
        (&s.orders, &s.participants, &s.line_items, &s.activity, &s.activity_index).transaction(
            |(orders, participants, line_items, log, index)| -> ConflictableTransactionResult<(), PortalError> {
                if orders.get(order.id.as_bytes())?.is_some() {
                    return tx_abort(PortalError::InvalidInput(format!(
                        "order '{}' already exists",
                        order.id
                    )));
                }
                orders.insert(order.id.as_bytes(), tx_encode(&order)?)?;
                participants.insert(order.id.as_bytes(), tx_encode(&ledger)?)?;
                line_items.insert(order.id.as_bytes(), tx_encode(&draft.items)?)?;
                activity::append_in_tx(log, index, &event)?;
                Ok(())
            },
        )?;

        info!(
            order_id = %order.id,
            order_type = %order.order_type,
            status = %order.status,
            actor = %creator.user_id,
            participants = ledger.rows().len(),
            "order created"
        );
        Ok(OrderState::for_caller(OrderSnapshot { order, ledger }, creator))
    }

    /// Read an order and its ledger. No visibility check.
    pub fn load(&self, order_id: &str) -> Result<OrderSnapshot> {
        let Some(bytes) = self.store.orders.get(order_id.as_bytes())? else {
            return Err(PortalError::not_found("order", order_id));
        };
        let order: Order = store::decode(&bytes)?;
        let ledger = match self.store.participants.get(order_id.as_bytes())? {
            Some(bytes) => store::decode(&bytes)?,
            None => ParticipantLedger::new(order_id),
        };
        Ok(OrderSnapshot { order, ledger })
    }

    pub fn line_items(&self, order_id: &str) -> Result<Vec<LineItem>> {
        match self.store.line_items.get(order_id.as_bytes())? {
            Some(bytes) => store::decode(&bytes),
            None => Err(PortalError::not_found("order", order_id)),
        }
    }

    fn can_see(
        &self,
        snapshot: &OrderSnapshot,
        actor: &Actor,
        scope: &mut RequestScope<'_>,
    ) -> Result<bool> {
        if actor.is_admin() || snapshot.ledger.is_listed(&actor.user_id) {
            return Ok(true);
        }
        let ecosystem = scope.ecosystem_of(actor)?;
        Ok(snapshot
            .order
            .related()
            .iter()
            .any(|r| ecosystem.contains(&r.id)))
    }

    /// Current state plus the caller's allowed actions. Orders outside the
    /// caller's reach read as missing.
    pub fn view(&self, order_id: &str, actor: &Actor, scope: &mut RequestScope<'_>) -> Result<OrderState> {
        let snapshot = self.load(order_id)?;
        if !self.can_see(&snapshot, actor, scope)? {
            return Err(PortalError::not_found("order", order_id));
        }
        Ok(OrderState::for_caller(snapshot, actor))
    }

    /// Active orders the caller can see, filtered to the statuses its role
    /// browses, newest first.
    pub fn list_visible(&self, actor: &Actor, scope: &mut RequestScope<'_>) -> Result<Vec<Order>> {
        let mut out = vec![];
        for item in self.store.orders.iter() {
            let (key, _) = item?;
            let order_id = String::from_utf8_lossy(&key).into_owned();
            let snapshot = self.load(&order_id)?;
            if snapshot.order.is_archived() {
                continue;
            }
            if !policy::visible_statuses(actor.role, snapshot.order.order_type)
                .contains(&snapshot.order.status)
            {
                continue;
            }
            if self.can_see(&snapshot, actor, scope)? {
                out.push(snapshot.order);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(out)
    }

    pub fn apply_action(&self, req: &ActionRequest) -> Result<OrderState> {
        check_version(req.policy_version)?;
        let snapshot = self.load(&req.order_id)?;
        self.apply_on(snapshot, req)
    }

    /// Decide against `snapshot` and commit only if the stored status still
    /// matches it.
    pub fn apply_on(&self, snapshot: OrderSnapshot, req: &ActionRequest) -> Result<OrderState> {
        check_version(req.policy_version)?;
        let actor = &req.actor;
        let order = &snapshot.order;
        if order.is_archived() && !req.action.is_read_only() {
            warn!(order_id = %order.id, action = %req.action, actor = %actor.user_id, "action on archived order");
            return Err(PortalError::InvalidTransition(format!(
                "order '{}' is archived",
                order.id
            )));
        }

        let participation = snapshot.ledger.participation_for(&actor.user_id);
        let (next, effect) = match policy::decide(
            actor.role,
            order.order_type,
            order.status,
            participation,
            req.action,
        ) {
            Decision::Allow { next, effect } => (next, effect),
            Decision::Deny { reason } => {
                warn!(
                    order_id = %order.id,
                    action = %req.action,
                    actor = %actor.user_id,
                    status = %order.status,
                    reason = %reason,
                    "transition denied"
                );
                return Err(PortalError::InvalidTransition(reason));
            }
        };
        if req.action.is_read_only() {
            return Ok(OrderState::for_caller(snapshot, actor));
        }
        let Some(order_event) = OrderEvent::from_action(req.action) else {
            return Ok(OrderState::for_caller(snapshot, actor));
        };

        let now = self.clock.now();
        let expected = order.status;
        let service = match effect {
            Some(SideEffect::CreateService) => Some(Entity {
                id: self.mint_code("SVC")?,
                kind: EntityKind::Service,
                name: format!("Service for {}", order.id),
                owner: order.link(EntityKind::Center).map(str::to_string),
                created_at: now,
                archive: None,
                source_order: Some(order.id.clone()),
            }),
            None => None,
        };
        let acting_as = if participation.is_creator && !participation.is_assigned_actor {
            ParticipationType::Creator
        } else {
            ParticipationType::Actor
        };

        let event = SystemActivity::new(ActivityType::Order(order_event), actor, order.entity_ref(), now)?
            .with_detail(ActivityDetail::StatusChange {
                action: Some(req.action),
                from: Some(expected),
                to: next,
            });

        let s = &self.store;
        let (record, ledger) = (
            &s.orders,
            &s.participants,
            &s.entities,
            &s.entity_children,
            &s.activity,
            &s.activity_index,
        )
            .transaction(
                |(orders, participants, entities, children, log, index)| -> ConflictableTransactionResult<(Order, ParticipantLedger), PortalError> {
                    // other writers may have touched links since the snapshot
                    let mut record = read_order_in_tx(orders, &order.id)?;
                    if record.status != expected {
                        return tx_abort(PortalError::StaleState {
                            order_id: order.id.clone(),
                            expected: expected.to_string(),
                        });
                    }
                    if record.is_archived() {
                        return tx_abort(PortalError::InvalidTransition(format!(
                            "order '{}' is archived",
                            order.id
                        )));
                    }
                    record.status = next;
                    record.next_actor_role = policy::next_actor_role(record.order_type, next);
                    record.updated_at = now;

                    let mut ledger = read_ledger_in_tx(participants, &order.id)?;
                    ledger.append(&actor.user_id, actor.role, acting_as, now);

                    if let Some(service) = &service {
                        if entities.get(service.id.as_bytes())?.is_some() {
                            return tx_abort(PortalError::InvalidInput(format!(
                                "service '{}' already exists",
                                service.id
                            )));
                        }
                        directory::insert_entity_in_tx(entities, children, service)?;
                        record.set_link(service.entity_ref());
                    }
                    let event = event.clone().with_links(record.related());
                    orders.insert(record.id.as_bytes(), tx_encode(&record)?)?;
                    participants.insert(record.id.as_bytes(), tx_encode(&ledger)?)?;
                    activity::append_in_tx(log, index, &event)?;
                    Ok((record, ledger))
                },
            )
            .inspect_err(|e| {
                if matches!(e, sled::transaction::TransactionError::Abort(PortalError::StaleState { .. })) {
                    warn!(order_id = %order.id, action = %req.action, actor = %actor.user_id, "stale transition");
                }
            })?;

        info!(
            order_id = %record.id,
            action = %req.action,
            actor = %actor.user_id,
            from = %expected,
            to = %next,
            service = service.as_ref().map(|s| s.id.as_str()).unwrap_or("-"),
            "transition committed"
        );
        let mut state = OrderState::for_caller(
            OrderSnapshot {
                order: record,
                ledger,
            },
            actor,
        );
        state.created_service = service;
        Ok(state)
    }

    /// Put a crew on a pending service order without moving its status.
    /// Only the manager or warehouse currently holding the order may do it.
    pub fn request_crew(&self, order_id: &str, crew_id: &str, actor: &Actor) -> Result<OrderState> {
        let snapshot = self.load(order_id)?;
        let order = &snapshot.order;
        let participation = snapshot.ledger.participation_for(&actor.user_id);
        let holds_order = participation.is_assigned_actor
            && matches!(actor.role, Role::Manager | Role::Warehouse)
            && order.next_actor_role.is_some()
            && matches!(
                order.status,
                OrderStatus::PendingManager | OrderStatus::PendingWarehouse | OrderStatus::PendingCrew
            );
        if order.order_type != OrderType::Service || order.is_archived() || !holds_order {
            warn!(order_id = %order.id, actor = %actor.user_id, status = %order.status, "crew request denied");
            return Err(PortalError::InvalidTransition(format!(
                "role '{}' cannot request crew on order '{}' at status '{}'",
                actor.role, order.id, order.status
            )));
        }
        let crew = self.active_entity(crew_id, EntityKind::Crew)?;
        let mut scope = self.resolver.scope();
        if !self.within_reach(&self.reach_root(actor)?, &crew, &mut scope)? {
            warn!(order_id = %order.id, crew = %crew.id, actor = %actor.user_id, "crew outside caller's reach");
            return Err(PortalError::not_found("crew", crew_id));
        }

        let now = self.clock.now();
        let expected = order.status;
        let expected_crew = order.link(EntityKind::Crew).map(str::to_string);
        let event = SystemActivity::new(
            ActivityType::Order(OrderEvent::CrewRequested),
            actor,
            order.entity_ref(),
            now,
        )?;

        let s = &self.store;
        let (record, ledger) = (&s.orders, &s.participants, &s.activity, &s.activity_index).transaction(
            |(orders, participants, log, index)| -> ConflictableTransactionResult<(Order, ParticipantLedger), PortalError> {
                let mut record = read_order_in_tx(orders, &order.id)?;
                // a crew request that landed since the snapshot makes this one stale
                if record.status != expected || record.link(EntityKind::Crew) != expected_crew.as_deref() {
                    return tx_abort(PortalError::StaleState {
                        order_id: order.id.clone(),
                        expected: expected.to_string(),
                    });
                }
                record.set_link(crew.entity_ref());
                record.updated_at = now;
                let mut ledger = read_ledger_in_tx(participants, &order.id)?;
                ledger.append(&crew.id, Role::Crew, ParticipationType::Actor, now);
                let event = event.clone().with_links(record.related());
                orders.insert(record.id.as_bytes(), tx_encode(&record)?)?;
                participants.insert(record.id.as_bytes(), tx_encode(&ledger)?)?;
                activity::append_in_tx(log, index, &event)?;
                Ok((record, ledger))
            },
        )?;

        info!(order_id = %record.id, crew = %crew.id, actor = %actor.user_id, "crew requested");
        Ok(OrderState::for_caller(
            OrderSnapshot {
                order: record,
                ledger,
            },
            actor,
        ))
    }

    /// Whose reach a crew request is judged from. A warehouse acts for the
    /// contractor it is linked to.
    fn reach_root(&self, actor: &Actor) -> Result<Actor> {
        if actor.role != Role::Warehouse {
            return Ok(actor.clone());
        }
        let owner = self
            .resolver
            .directory()
            .find(&actor.user_id)?
            .and_then(|wh| wh.owner);
        Ok(match owner {
            Some(contractor) => Actor::new(contractor, Role::Contractor),
            None => actor.clone(),
        })
    }
}

fn check_version(client: PolicyVersion) -> Result<()> {
    if client != PolicyVersion::CURRENT {
        return Err(PortalError::PolicyVersionMismatch {
            client,
            server: PolicyVersion::CURRENT,
        });
    }
    Ok(())
}

fn read_order_in_tx(
    orders: &TransactionalTree,
    order_id: &str,
) -> ConflictableTransactionResult<Order, PortalError> {
    match orders.get(order_id.as_bytes())? {
        Some(bytes) => tx_decode(&bytes),
        None => tx_abort(PortalError::not_found("order", order_id)),
    }
}

fn read_ledger_in_tx(
    participants: &TransactionalTree,
    order_id: &str,
) -> ConflictableTransactionResult<ParticipantLedger, PortalError> {
    match participants.get(order_id.as_bytes())? {
        Some(bytes) => tx_decode(&bytes),
        None => Ok(ParticipantLedger::new(order_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityRef, TimeStamp};

    /// Bare order for tests that need a record without going through creation.
    fn sample_order(id: &str, order_type: OrderType, status: OrderStatus) -> Order {
        let now = TimeStamp::new();
        Order {
            id: id.to_string(),
            order_type,
            status,
            creator_id: "CEN-001".into(),
            creator_role: Role::Center,
            destination_id: "WH-001".into(),
            destination_role: Role::Warehouse,
            next_actor_role: policy::next_actor_role(order_type, status),
            requested_date: None,
            links: vec![EntityRef::new(EntityKind::Center, "CEN-001")],
            created_at: now,
            updated_at: now,
            archive: None,
        }
    }

    #[test]
    fn stale_clients_are_turned_away() {
        assert!(check_version(PolicyVersion::CURRENT).is_ok());
        let err = check_version(PolicyVersion(0)).unwrap_err();
        assert!(matches!(
            err,
            PortalError::PolicyVersionMismatch {
                client: PolicyVersion(0),
                server: PolicyVersion::CURRENT
            }
        ));
    }

    #[test]
    fn archived_orders_only_offer_view() {
        let mut order = sample_order("PRD-0001", OrderType::Product, OrderStatus::PendingWarehouse);
        let mut ledger = ParticipantLedger::new("PRD-0001");
        ledger.append("WH-001", Role::Warehouse, ParticipationType::Destination, TimeStamp::new());
        let warehouse = Actor::new("WH-001", Role::Warehouse);

        let live = OrderState::for_caller(
            OrderSnapshot {
                order: order.clone(),
                ledger: ledger.clone(),
            },
            &warehouse,
        );
        assert!(live.allowed_actions.contains(&OrderAction::Deliver));

        order.archive = Some(crate::archive::ArchiveStamp::new(TimeStamp::new(), "ADMIN-001", None, 30));
        let archived = OrderState::for_caller(OrderSnapshot { order, ledger }, &warehouse);
        assert_eq!(archived.allowed_actions, vec![OrderAction::View]);
    }
}
