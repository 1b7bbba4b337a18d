//! Order policy: which caller may do what to an order, and where it goes next.
//!
//! Everything in here is pure. The executor asks for a [`Decision`] and does
//! the I/O itself, including any side effect the decision names.
use crate::error::PortalError;
use crate::types::Role;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    #[n(0)]
    Product,
    #[n(1)]
    Service,
}

#[derive(
    minicbor::Encode,
    minicbor::Decode,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[n(0)]
    PendingWarehouse,
    #[n(1)]
    AwaitingDelivery,
    #[n(2)]
    OutForDelivery,
    #[n(3)]
    Delivered,
    #[n(4)]
    PendingCustomer,
    #[n(5)]
    PendingContractor,
    #[n(6)]
    PendingManager,
    #[n(7)]
    PendingCrew,
    #[n(8)]
    CrewAssigned,
    #[n(9)]
    ServiceCreated,
    #[n(10)]
    Completed,
    #[n(11)]
    Rejected,
    #[n(12)]
    Cancelled,
}

#[derive(
    minicbor::Encode, minicbor::Decode, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum OrderAction {
    #[n(0)]
    View,
    #[n(1)]
    Accept,
    #[n(2)]
    Reject,
    #[n(3)]
    StartDelivery,
    #[n(4)]
    Deliver,
    #[n(5)]
    Complete,
    #[n(6)]
    Cancel,
    #[n(7)]
    CreateService,
}

/// Stamp on the rule table. Bump whenever a row in [`RULES`] changes meaning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyVersion(pub u32);

impl PolicyVersion {
    pub const CURRENT: PolicyVersion = PolicyVersion(1);
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// How the caller relates to the order, as read from the participant ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Participation {
    pub is_creator: bool,
    pub is_assigned_actor: bool,
}

impl Participation {
    pub fn new(is_creator: bool, is_assigned_actor: bool) -> Self {
        Self {
            is_creator,
            is_assigned_actor,
        }
    }
    pub fn is_participant(&self) -> bool {
        self.is_creator || self.is_assigned_actor
    }
}

/// Work the executor must perform atomically with the status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    CreateService,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow {
        next: OrderStatus,
        effect: Option<SideEffect>,
    },
    Deny {
        reason: String,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub action: OrderAction,
    pub reason: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl From<InvalidTransition> for PortalError {
    fn from(value: InvalidTransition) -> Self {
        PortalError::InvalidTransition(value.reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Caller has this role and sits in the ledger as actor or destination.
    Assigned(Role),
    Creator,
}

impl Gate {
    fn admits(&self, role: Role, participation: Participation) -> bool {
        match self {
            Gate::Assigned(r) => *r == role && participation.is_assigned_actor,
            Gate::Creator => participation.is_creator,
        }
    }
}

#[derive(Debug)]
struct Rule {
    order_type: OrderType,
    from: OrderStatus,
    action: OrderAction,
    to: OrderStatus,
    gates: &'static [Gate],
    effect: Option<SideEffect>,
}

const fn rule(
    order_type: OrderType,
    from: OrderStatus,
    action: OrderAction,
    to: OrderStatus,
    gates: &'static [Gate],
) -> Rule {
    Rule {
        order_type,
        from,
        action,
        to,
        gates,
        effect: None,
    }
}

const fn spawn_service(
    order_type: OrderType,
    from: OrderStatus,
    gates: &'static [Gate],
) -> Rule {
    Rule {
        order_type,
        from,
        action: OrderAction::CreateService,
        to: OrderStatus::ServiceCreated,
        gates,
        effect: Some(SideEffect::CreateService),
    }
}

use OrderAction as A;
use OrderStatus as S;
use OrderType::{Product as P, Service as V};

const WAREHOUSE: &[Gate] = &[Gate::Assigned(Role::Warehouse)];
const CUSTOMER: &[Gate] = &[Gate::Assigned(Role::Customer)];
const CONTRACTOR: &[Gate] = &[Gate::Assigned(Role::Contractor)];
const MANAGER: &[Gate] = &[Gate::Assigned(Role::Manager)];
const CREW: &[Gate] = &[Gate::Assigned(Role::Crew)];
const CREATOR: &[Gate] = &[Gate::Creator];
const CREATOR_OR_CUSTOMER: &[Gate] = &[Gate::Creator, Gate::Assigned(Role::Customer)];
const CREATOR_OR_CONTRACTOR: &[Gate] = &[Gate::Creator, Gate::Assigned(Role::Contractor)];
const CREATOR_OR_MANAGER: &[Gate] = &[Gate::Creator, Gate::Assigned(Role::Manager)];

/// One row per (order type, status, action). No row maps a status to itself.
const RULES: &[Rule] = &[
    // product
    rule(P, S::PendingWarehouse, A::Accept, S::AwaitingDelivery, WAREHOUSE),
    rule(P, S::PendingWarehouse, A::Reject, S::Rejected, WAREHOUSE),
    rule(P, S::PendingWarehouse, A::Deliver, S::Delivered, WAREHOUSE),
    rule(P, S::PendingWarehouse, A::Cancel, S::Cancelled, CREATOR),
    rule(P, S::AwaitingDelivery, A::StartDelivery, S::OutForDelivery, WAREHOUSE),
    rule(P, S::AwaitingDelivery, A::Deliver, S::Delivered, WAREHOUSE),
    rule(P, S::AwaitingDelivery, A::Cancel, S::Cancelled, WAREHOUSE),
    rule(P, S::OutForDelivery, A::Deliver, S::Delivered, WAREHOUSE),
    // service
    rule(V, S::PendingCustomer, A::Accept, S::PendingContractor, CUSTOMER),
    rule(V, S::PendingCustomer, A::Reject, S::Rejected, CUSTOMER),
    rule(V, S::PendingCustomer, A::Cancel, S::Cancelled, CREATOR),
    rule(V, S::PendingContractor, A::Accept, S::PendingManager, CONTRACTOR),
    rule(V, S::PendingContractor, A::Reject, S::Rejected, CONTRACTOR),
    rule(V, S::PendingContractor, A::Cancel, S::Cancelled, CREATOR_OR_CUSTOMER),
    rule(V, S::PendingManager, A::Accept, S::PendingCrew, MANAGER),
    rule(V, S::PendingManager, A::Reject, S::Rejected, MANAGER),
    rule(V, S::PendingManager, A::Cancel, S::Cancelled, CREATOR_OR_CONTRACTOR),
    spawn_service(V, S::PendingManager, MANAGER),
    rule(V, S::PendingWarehouse, A::Accept, S::PendingCrew, WAREHOUSE),
    rule(V, S::PendingWarehouse, A::Reject, S::Rejected, WAREHOUSE),
    rule(V, S::PendingWarehouse, A::Cancel, S::Cancelled, CREATOR),
    spawn_service(V, S::PendingWarehouse, WAREHOUSE),
    rule(V, S::PendingCrew, A::Accept, S::CrewAssigned, CREW),
    rule(V, S::PendingCrew, A::Reject, S::Rejected, CREW),
    rule(V, S::PendingCrew, A::Cancel, S::Cancelled, CREATOR_OR_MANAGER),
    spawn_service(V, S::PendingCrew, CREW),
    rule(V, S::CrewAssigned, A::Complete, S::Completed, CREW),
    rule(V, S::CrewAssigned, A::Cancel, S::Cancelled, MANAGER),
    spawn_service(V, S::CrewAssigned, CREW),
];

const PRODUCT_STATUSES: &[OrderStatus] = &[
    S::PendingWarehouse,
    S::AwaitingDelivery,
    S::OutForDelivery,
    S::Delivered,
    S::Rejected,
    S::Cancelled,
];

const SERVICE_STATUSES: &[OrderStatus] = &[
    S::PendingCustomer,
    S::PendingContractor,
    S::PendingManager,
    S::PendingWarehouse,
    S::PendingCrew,
    S::CrewAssigned,
    S::ServiceCreated,
    S::Completed,
    S::Rejected,
    S::Cancelled,
];

impl OrderType {
    pub const ALL: [OrderType; 2] = [OrderType::Product, OrderType::Service];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Product => "product",
            OrderType::Service => "service",
        }
    }

    pub fn statuses(&self) -> &'static [OrderStatus] {
        match self {
            OrderType::Product => PRODUCT_STATUSES,
            OrderType::Service => SERVICE_STATUSES,
        }
    }

    pub fn admits(&self, status: OrderStatus) -> bool {
        self.statuses().contains(&status)
    }

    /// Prefix of order codes of this type.
    pub fn code_prefix(&self) -> &'static str {
        match self {
            OrderType::Product => "PRD",
            OrderType::Service => "SRV",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| PortalError::InvalidInput(format!("unknown order type '{s}'")))
    }
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 13] = [
        S::PendingWarehouse,
        S::AwaitingDelivery,
        S::OutForDelivery,
        S::Delivered,
        S::PendingCustomer,
        S::PendingContractor,
        S::PendingManager,
        S::PendingCrew,
        S::CrewAssigned,
        S::ServiceCreated,
        S::Completed,
        S::Rejected,
        S::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            S::PendingWarehouse => "pending_warehouse",
            S::AwaitingDelivery => "awaiting_delivery",
            S::OutForDelivery => "out_for_delivery",
            S::Delivered => "delivered",
            S::PendingCustomer => "pending_customer",
            S::PendingContractor => "pending_contractor",
            S::PendingManager => "pending_manager",
            S::PendingCrew => "pending_crew",
            S::CrewAssigned => "crew_assigned",
            S::ServiceCreated => "service_created",
            S::Completed => "completed",
            S::Rejected => "rejected",
            S::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            S::Delivered | S::Cancelled | S::Rejected | S::Completed | S::ServiceCreated
        )
    }

    /// Human label for order lists.
    pub fn label(&self) -> &'static str {
        match self {
            S::PendingWarehouse => "Pending Warehouse",
            S::AwaitingDelivery => "Awaiting Delivery",
            S::OutForDelivery => "Out for Delivery",
            S::Delivered => "Delivered",
            S::PendingCustomer => "Pending Customer",
            S::PendingContractor => "Pending Contractor",
            S::PendingManager => "Pending Manager",
            S::PendingCrew => "Pending Crew",
            S::CrewAssigned => "Crew Assigned",
            S::ServiceCreated => "Service Created",
            S::Completed => "Completed",
            S::Rejected => "Rejected",
            S::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| PortalError::InvalidInput(format!("unknown order status '{s}'")))
    }
}

impl OrderAction {
    pub const ALL: [OrderAction; 8] = [
        A::View,
        A::Accept,
        A::Reject,
        A::StartDelivery,
        A::Deliver,
        A::Complete,
        A::Cancel,
        A::CreateService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            A::View => "view",
            A::Accept => "accept",
            A::Reject => "reject",
            A::StartDelivery => "start-delivery",
            A::Deliver => "deliver",
            A::Complete => "complete",
            A::Cancel => "cancel",
            A::CreateService => "create-service",
        }
    }

    /// `view` is answered from the current state and never writes.
    pub fn is_read_only(&self) -> bool {
        matches!(self, A::View)
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderAction {
    type Err = PortalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderAction::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| PortalError::InvalidInput(format!("unknown order action '{s}'")))
    }
}

fn find_rule(order_type: OrderType, status: OrderStatus, action: OrderAction) -> Option<&'static Rule> {
    RULES
        .iter()
        .find(|r| r.order_type == order_type && r.from == status && r.action == action)
}

/// Whether a caller of `role` may open an order of this type at all.
pub fn can_create(role: Role, order_type: OrderType) -> bool {
    match order_type {
        OrderType::Product => matches!(
            role,
            Role::Manager | Role::Contractor | Role::Customer | Role::Center | Role::Crew
        ),
        OrderType::Service => matches!(
            role,
            Role::Manager | Role::Contractor | Role::Customer | Role::Center
        ),
    }
}

/// Starting status for a new order. Service orders skip the approval stages
/// the creator already occupies; warehouse-managed services go straight to
/// the warehouse.
pub fn initial_status(
    order_type: OrderType,
    creator_role: Role,
    destination_role: Role,
) -> Option<OrderStatus> {
    if !can_create(creator_role, order_type) {
        return None;
    }
    match order_type {
        OrderType::Product => (destination_role == Role::Warehouse).then_some(S::PendingWarehouse),
        OrderType::Service if destination_role == Role::Warehouse => Some(S::PendingWarehouse),
        OrderType::Service => match creator_role {
            Role::Center => Some(S::PendingCustomer),
            Role::Customer => Some(S::PendingContractor),
            Role::Contractor => Some(S::PendingManager),
            Role::Manager => Some(S::PendingCrew),
            _ => None,
        },
    }
}

/// The role expected to move the order out of `status`.
pub fn next_actor_role(order_type: OrderType, status: OrderStatus) -> Option<Role> {
    if !order_type.admits(status) || status.is_terminal() {
        return None;
    }
    Some(match status {
        S::PendingWarehouse | S::AwaitingDelivery | S::OutForDelivery => Role::Warehouse,
        S::PendingCustomer => Role::Customer,
        S::PendingContractor => Role::Contractor,
        S::PendingManager => Role::Manager,
        S::PendingCrew | S::CrewAssigned => Role::Crew,
        _ => return None,
    })
}

/// Actions the caller may take right now. Unknown statuses and unauthorised
/// callers get an empty list; `view` is offered to every participant.
pub fn get_allowed_actions(
    role: Role,
    order_type: OrderType,
    status: OrderStatus,
    is_creator: bool,
    is_assigned_actor: bool,
) -> Vec<OrderAction> {
    if !order_type.admits(status) {
        return vec![];
    }
    let participation = Participation::new(is_creator, is_assigned_actor);
    let mut actions: Vec<OrderAction> = RULES
        .iter()
        .filter(|r| r.order_type == order_type && r.from == status)
        .filter(|r| r.gates.iter().any(|g| g.admits(role, participation)))
        .map(|r| r.action)
        .collect();
    if participation.is_participant() {
        actions.insert(0, OrderAction::View);
    }
    actions
}

/// Where `action` takes an order of this type from `status`, ignoring who asks.
pub fn get_next_status(
    order_type: OrderType,
    status: OrderStatus,
    action: OrderAction,
) -> Result<OrderStatus, InvalidTransition> {
    let deny = |reason: String| InvalidTransition {
        order_type,
        status,
        action,
        reason,
    };
    if !order_type.admits(status) {
        return Err(deny(format!(
            "status '{status}' does not exist for {order_type} orders"
        )));
    }
    if action.is_read_only() {
        return Ok(status);
    }
    if status.is_terminal() {
        return Err(deny(format!(
            "order is {status}; no further action except view"
        )));
    }
    find_rule(order_type, status, action)
        .map(|r| r.to)
        .ok_or_else(|| deny(format!("no '{action}' transition from '{status}' for {order_type} orders")))
}

pub fn can_transition(
    role: Role,
    order_type: OrderType,
    status: OrderStatus,
    participation: Participation,
    action: OrderAction,
) -> bool {
    decide(role, order_type, status, participation, action).is_allowed()
}

/// Full decision with the denial reason a UI can show.
pub fn decide(
    role: Role,
    order_type: OrderType,
    status: OrderStatus,
    participation: Participation,
    action: OrderAction,
) -> Decision {
    let allowed = get_allowed_actions(
        role,
        order_type,
        status,
        participation.is_creator,
        participation.is_assigned_actor,
    );
    if !allowed.contains(&action) {
        return Decision::Deny {
            reason: format!("action '{action}' not allowed for role '{role}' at status '{status}'"),
        };
    }
    match get_next_status(order_type, status, action) {
        Ok(next) => Decision::Allow {
            next,
            effect: find_rule(order_type, status, action).and_then(|r| r.effect),
        },
        Err(e) => Decision::Deny { reason: e.reason },
    }
}

/// Statuses a role's order lists are filtered to. Admins browse every status.
pub fn visible_statuses(role: Role, order_type: OrderType) -> Vec<OrderStatus> {
    let hidden: &[OrderStatus] = match (order_type, role) {
        (_, Role::Admin) => &[],
        (P, Role::Warehouse | Role::Center | Role::Customer) => &[S::OutForDelivery],
        (P, _) => return vec![],
        (V, Role::Warehouse) => &[
            S::PendingCustomer,
            S::PendingContractor,
            S::PendingManager,
            S::CrewAssigned,
            S::Completed,
        ],
        (V, Role::Manager) => &[S::PendingWarehouse],
        (V, Role::Contractor) => &[S::PendingCustomer],
        (V, Role::Crew) => &[
            S::PendingCustomer,
            S::PendingContractor,
            S::PendingManager,
            S::PendingWarehouse,
            S::Rejected,
        ],
        (V, Role::Center | Role::Customer) => &[],
    };
    order_type
        .statuses()
        .iter()
        .copied()
        .filter(|s| !hidden.contains(s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSIGNED: Participation = Participation {
        is_creator: false,
        is_assigned_actor: true,
    };

    #[test]
    fn every_rule_stays_inside_its_order_type() {
        for r in RULES {
            assert!(r.order_type.admits(r.from), "{:?}", r);
            assert!(r.order_type.admits(r.to), "{:?}", r);
            assert_ne!(r.from, r.to, "self loop defeats compare-and-set: {:?}", r);
            assert!(!r.from.is_terminal(), "{:?}", r);
        }
    }

    #[test]
    fn rule_keys_are_unique() {
        for (i, a) in RULES.iter().enumerate() {
            for b in &RULES[i + 1..] {
                assert!(
                    !(a.order_type == b.order_type && a.from == b.from && a.action == b.action),
                    "duplicate rule {:?}",
                    a
                );
            }
        }
    }

    #[test]
    fn warehouse_can_deliver_pending_product() {
        let actions = get_allowed_actions(
            Role::Warehouse,
            OrderType::Product,
            S::PendingWarehouse,
            false,
            true,
        );
        assert_eq!(actions, vec![A::View, A::Accept, A::Reject, A::Deliver]);
    }

    #[test]
    fn unassigned_warehouse_gets_nothing() {
        let actions = get_allowed_actions(
            Role::Warehouse,
            OrderType::Product,
            S::PendingWarehouse,
            false,
            false,
        );
        assert!(actions.is_empty());
    }

    #[test]
    fn status_outside_the_type_yields_nothing() {
        let actions =
            get_allowed_actions(Role::Crew, OrderType::Product, S::PendingCrew, true, true);
        assert!(actions.is_empty());
        assert!(get_next_status(OrderType::Product, S::PendingCrew, A::View).is_err());
    }

    #[test]
    fn terminal_statuses_only_offer_view() {
        for ty in OrderType::ALL {
            for status in ty.statuses().iter().filter(|s| s.is_terminal()) {
                for role in Role::ALL {
                    let actions = get_allowed_actions(role, ty, *status, true, true);
                    assert_eq!(actions, vec![A::View]);
                }
                assert_eq!(get_next_status(ty, *status, A::View), Ok(*status));
                assert!(get_next_status(ty, *status, A::Cancel).is_err());
            }
        }
    }

    #[test]
    fn creator_cancels_only_before_warehouse_accepts() {
        let creator = Participation::new(true, false);
        assert!(can_transition(Role::Center, P, S::PendingWarehouse, creator, A::Cancel));
        assert!(!can_transition(Role::Center, P, S::AwaitingDelivery, creator, A::Cancel));
    }

    #[test]
    fn crew_create_service_carries_side_effect() {
        let decision = decide(Role::Crew, V, S::PendingCrew, ASSIGNED, A::CreateService);
        assert_eq!(
            decision,
            Decision::Allow {
                next: S::ServiceCreated,
                effect: Some(SideEffect::CreateService),
            }
        );
    }

    #[test]
    fn denial_explains_itself() {
        match decide(Role::Customer, V, S::PendingManager, ASSIGNED, A::Accept) {
            Decision::Deny { reason } => assert!(reason.contains("pending_manager")),
            other => panic!("expected denial, got {other:?}"),
        }
    }

    #[test]
    fn service_start_depends_on_creator() {
        assert_eq!(initial_status(V, Role::Center, Role::Center), Some(S::PendingCustomer));
        assert_eq!(initial_status(V, Role::Customer, Role::Center), Some(S::PendingContractor));
        assert_eq!(initial_status(V, Role::Manager, Role::Center), Some(S::PendingCrew));
        assert_eq!(initial_status(V, Role::Center, Role::Warehouse), Some(S::PendingWarehouse));
        assert_eq!(initial_status(P, Role::Center, Role::Warehouse), Some(S::PendingWarehouse));
        assert_eq!(initial_status(P, Role::Center, Role::Customer), None);
        assert_eq!(initial_status(V, Role::Warehouse, Role::Center), None);
    }

    #[test]
    fn next_actor_follows_status() {
        assert_eq!(next_actor_role(P, S::AwaitingDelivery), Some(Role::Warehouse));
        assert_eq!(next_actor_role(V, S::PendingCrew), Some(Role::Crew));
        assert_eq!(next_actor_role(V, S::ServiceCreated), None);
    }

    #[test]
    fn names_round_trip_through_from_str() {
        for a in OrderAction::ALL {
            assert_eq!(a.as_str().parse::<OrderAction>().unwrap(), a);
        }
        for s in OrderStatus::ALL {
            assert_eq!(s.as_str().parse::<OrderStatus>().unwrap(), s);
        }
    }
}
