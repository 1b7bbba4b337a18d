//! Shared fixture: a fresh sled database under a temp dir, a settable clock
//! and two disjoint hierarchies.
//!
//! ```text
//! MGR-001 ─ CON-001 ─┬─ CUS-001 ─┬─ CEN-001 ─ CRW-001
//!                    │           └─ CEN-010 ─ CRW-006
//!                    └─ WH-001
//! MGR-002 ─ CON-002 ─── CUS-002 ─── CEN-002 ─ CRW-007
//! ```
#![allow(dead_code)]

use portal_orders::Portal;
use portal_orders::clock::ManualClock;
use portal_orders::directory::EntityDraft;
use portal_orders::order::{LineItem, OrderDraft};
use portal_orders::store::Store;
use portal_orders::types::{Actor, EntityKind, Role, TimeStamp};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

pub struct Fixture {
    // keeps the database directory alive for the test
    _dir: TempDir,
    pub portal: Portal,
    pub clock: Arc<ManualClock>,
}

pub fn start() -> TimeStamp<chrono::Utc> {
    TimeStamp::new_with(2025, 1, 1, 9, 0, 0)
}

pub fn fixture() -> anyhow::Result<Fixture> {
    let dir = tempdir()?;
    let store = Store::open(dir.path().join("portal.db"))?;
    let clock = Arc::new(ManualClock::starting_at(start()));
    let portal = Portal::new(store, clock.clone(), 30);
    Ok(Fixture {
        _dir: dir,
        portal,
        clock,
    })
}

/// Fixture with both hierarchies registered.
pub fn seeded() -> anyhow::Result<Fixture> {
    let fx = fixture()?;
    let admin = admin();
    let rows: &[(EntityKind, &str, Option<&str>)] = &[
        (EntityKind::Manager, "MGR-001", None),
        (EntityKind::Contractor, "CON-001", Some("MGR-001")),
        (EntityKind::Customer, "CUS-001", Some("CON-001")),
        (EntityKind::Center, "CEN-001", Some("CUS-001")),
        (EntityKind::Center, "CEN-010", Some("CUS-001")),
        (EntityKind::Crew, "CRW-001", Some("CEN-001")),
        (EntityKind::Crew, "CRW-006", Some("CEN-010")),
        (EntityKind::Warehouse, "WH-001", Some("CON-001")),
        (EntityKind::Manager, "MGR-002", None),
        (EntityKind::Contractor, "CON-002", Some("MGR-002")),
        (EntityKind::Customer, "CUS-002", Some("CON-002")),
        (EntityKind::Center, "CEN-002", Some("CUS-002")),
        (EntityKind::Crew, "CRW-007", Some("CEN-002")),
    ];
    for (kind, id, owner) in rows {
        let mut draft = EntityDraft::new(*kind, *id, format!("{kind} {id}"));
        if let Some(owner) = owner {
            draft = draft.owned_by(*owner);
        }
        fx.portal.directory.register(draft, &admin)?;
    }
    Ok(fx)
}

pub fn admin() -> Actor {
    Actor::new("ADMIN-001", Role::Admin)
}

pub fn actor(id: &str) -> Actor {
    let role = match &id[..3] {
        "MGR" => Role::Manager,
        "CON" => Role::Contractor,
        "CUS" => Role::Customer,
        "CEN" => Role::Center,
        "CRW" => Role::Crew,
        "WH-" => Role::Warehouse,
        _ => Role::Admin,
    };
    Actor::new(id, role)
}

pub fn product_to(warehouse: &str) -> OrderDraft {
    OrderDraft::product(
        warehouse,
        vec![LineItem {
            catalog_code: "PRD-MOP-01".into(),
            quantity: 4,
        }],
    )
}
