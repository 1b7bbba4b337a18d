//! Property-based tests for the order policy table
//!
//! The table is small enough to enumerate, but driving it through proptest
//! keeps the properties stated the way callers see them: arbitrary role,
//! order type, status, participation and action.

use proptest::prelude::*;
use portal_orders::policy::{
    self, Decision, OrderAction, OrderStatus, OrderType, Participation,
};
use portal_orders::types::Role;
use std::collections::{BTreeSet, VecDeque};

// PROPERTY TEST STRATEGIES

fn role_strategy() -> impl Strategy<Value = Role> {
    prop::sample::select(Role::ALL.to_vec())
}

fn order_type_strategy() -> impl Strategy<Value = OrderType> {
    prop::sample::select(OrderType::ALL.to_vec())
}

fn status_strategy() -> impl Strategy<Value = OrderStatus> {
    prop::sample::select(OrderStatus::ALL.to_vec())
}

fn action_strategy() -> impl Strategy<Value = OrderAction> {
    prop::sample::select(OrderAction::ALL.to_vec())
}

/// Every status reachable from some starting status of the order type.
fn reachable(order_type: OrderType) -> BTreeSet<OrderStatus> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<OrderStatus> = Role::ALL
        .into_iter()
        .flat_map(|creator| {
            Role::ALL
                .into_iter()
                .filter_map(move |dest| policy::initial_status(order_type, creator, dest))
        })
        .collect();
    while let Some(status) = queue.pop_front() {
        if !seen.insert(status) {
            continue;
        }
        for action in OrderAction::ALL {
            if let Ok(next) = policy::get_next_status(order_type, status, action) {
                queue.push_back(next);
            }
        }
    }
    seen
}

// PROPERTY TESTS
proptest! {
    /// Property: statuses outside the order type's set never offer anything
    #[test]
    fn prop_foreign_status_offers_nothing(
        role in role_strategy(),
        order_type in order_type_strategy(),
        status in status_strategy(),
        is_creator in any::<bool>(),
        is_assigned in any::<bool>(),
    ) {
        prop_assume!(!order_type.admits(status));
        prop_assert!(policy::get_allowed_actions(role, order_type, status, is_creator, is_assigned).is_empty());
    }

    /// Property: a caller with no participation gets an empty menu
    #[test]
    fn prop_non_participants_get_nothing(
        role in role_strategy(),
        order_type in order_type_strategy(),
        status in status_strategy(),
    ) {
        prop_assert!(policy::get_allowed_actions(role, order_type, status, false, false).is_empty());
    }

    /// Property: admins only move an order through creator-gated rows
    #[test]
    fn prop_admin_moves_orders_only_as_creator(
        order_type in order_type_strategy(),
        status in status_strategy(),
        is_creator in any::<bool>(),
        is_assigned in any::<bool>(),
    ) {
        let actions = policy::get_allowed_actions(Role::Admin, order_type, status, is_creator, is_assigned);
        // creator-gated rows do not look at role
        prop_assert!(actions.iter().all(|a| a.is_read_only() || *a == OrderAction::Cancel));
        prop_assert!(!actions.contains(&OrderAction::Cancel) || is_creator);
    }

    /// Property: terminal statuses permit nothing but view
    #[test]
    fn prop_terminal_statuses_only_view(
        role in role_strategy(),
        order_type in order_type_strategy(),
        status in status_strategy(),
        is_creator in any::<bool>(),
        is_assigned in any::<bool>(),
        action in action_strategy(),
    ) {
        prop_assume!(order_type.admits(status) && status.is_terminal());
        let actions = policy::get_allowed_actions(role, order_type, status, is_creator, is_assigned);
        prop_assert!(actions.iter().all(|a| *a == OrderAction::View));
        let next = policy::get_next_status(order_type, status, action);
        prop_assert_eq!(next.is_ok(), action.is_read_only());
    }

    /// Property: get_next_status is deterministic and stays inside the type
    #[test]
    fn prop_next_status_is_total_and_deterministic(
        order_type in order_type_strategy(),
        action in action_strategy(),
    ) {
        for status in reachable(order_type) {
            let first = policy::get_next_status(order_type, status, action);
            let second = policy::get_next_status(order_type, status, action);
            prop_assert_eq!(&first, &second);
            if let Ok(next) = first {
                prop_assert!(order_type.admits(next), "{} -> {}", status, next);
            }
        }
    }

    /// Property: every offered action is one the executor can carry out,
    /// and leads where the table says
    #[test]
    fn prop_offered_actions_are_allowed(
        role in role_strategy(),
        order_type in order_type_strategy(),
        status in status_strategy(),
        is_creator in any::<bool>(),
        is_assigned in any::<bool>(),
    ) {
        let participation = Participation::new(is_creator, is_assigned);
        for action in policy::get_allowed_actions(role, order_type, status, is_creator, is_assigned) {
            let decision = policy::decide(role, order_type, status, participation, action);
            let expected = policy::get_next_status(order_type, status, action);
            match (decision, expected) {
                (Decision::Allow { next, .. }, Ok(want)) => prop_assert_eq!(next, want),
                (other, want) => prop_assert!(false, "{:?} vs {:?}", other, want),
            }
            prop_assert!(policy::can_transition(role, order_type, status, participation, action));
        }
    }

    /// Property: next actor role is defined exactly for live statuses
    #[test]
    fn prop_next_actor_only_for_live_statuses(
        order_type in order_type_strategy(),
        status in status_strategy(),
    ) {
        let next = policy::next_actor_role(order_type, status);
        prop_assert_eq!(next.is_some(), order_type.admits(status) && !status.is_terminal());
    }
}

#[test]
fn every_reachable_status_belongs_to_its_type() {
    for order_type in OrderType::ALL {
        let statuses = reachable(order_type);
        assert!(!statuses.is_empty());
        for status in &statuses {
            assert!(order_type.admits(*status), "{order_type}: {status}");
        }
    }
    assert!(reachable(OrderType::Service).contains(&OrderStatus::ServiceCreated));
    assert!(reachable(OrderType::Product).contains(&OrderStatus::Delivered));
}

#[test]
fn visible_statuses_are_a_subset_of_the_type() {
    for order_type in OrderType::ALL {
        for role in Role::ALL {
            for status in policy::visible_statuses(role, order_type) {
                assert!(order_type.admits(status));
            }
        }
        assert_eq!(
            policy::visible_statuses(Role::Admin, order_type).len(),
            order_type.statuses().len()
        );
    }
    assert!(policy::visible_statuses(Role::Crew, OrderType::Product).is_empty());
}
