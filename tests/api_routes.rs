//! In-process tests for the HTTP surface.
//!
//! The router is built over a seeded temp database and driven through
//! `tower::ServiceExt::oneshot`; no socket is bound.
mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::seeded;
use http_body_util::BodyExt;
use portal_orders::api::{AppState, build_router};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt; // oneshot

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    // owns the temp database
    _fx: common::Fixture,
    router: axum::Router,
}

fn harness() -> Harness {
    let fx = seeded().unwrap();
    let state = Arc::new(AppState::new(fx.portal.clone(), 50));
    Harness {
        router: build_router(state),
        _fx: fx,
    }
}

fn request(method: &str, uri: &str, user: Option<(&str, &str)>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((id, role)) = user {
        builder = builder.header("x-user-id", id).header("x-user-role", role);
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Drive the router with one request and return (status, json body).
async fn call(h: &Harness, req: Request<Body>) -> (StatusCode, Value) {
    let resp = h.router.clone().oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let bytes = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("body is not valid JSON")
    };
    (status, body)
}

const CENTER: Option<(&str, &str)> = Some(("CEN-001", "center"));
const WAREHOUSE: Option<(&str, &str)> = Some(("WH-001", "warehouse"));
const ADMIN: Option<(&str, &str)> = Some(("ADMIN-001", "admin"));

async fn create_product_order(h: &Harness) -> String {
    let body = json!({
        "orderType": "product",
        "destinationId": "WH-001",
        "items": [{ "catalogCode": "PRD-MOP-01", "quantity": 2 }],
    });
    let (status, json) = call(h, request("POST", "/orders", CENTER, Some(body))).await;
    assert_eq!(status, StatusCode::CREATED, "{json}");
    json["id"].as_str().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// health and identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200() {
    let h = harness();
    let (status, json) = call(&h, request("GET", "/health", None, None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "portal-orders");
}

#[tokio::test]
async fn missing_identity_is_400() {
    let h = harness();
    let (status, json) = call(&h, request("GET", "/orders", None, None)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid_input");
}

#[tokio::test]
async fn unknown_role_is_400() {
    let h = harness();
    let (status, _) = call(&h, request("GET", "/orders", Some(("X-1", "overlord")), None)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// orders
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_order_is_404() {
    let h = harness();
    let (status, json) = call(&h, request("GET", "/orders/PRD-9999", CENTER, None)).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn created_order_shows_its_menu() {
    let h = harness();
    let id = create_product_order(&h).await;

    let (status, json) = call(&h, request("GET", &format!("/orders/{id}"), WAREHOUSE, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "pending_warehouse");
    assert_eq!(json["policyVersion"], 1);
    assert_eq!(json["allowedActions"], json!(["view", "accept", "reject", "deliver"]));

    let (status, json) = call(&h, request("GET", "/orders", CENTER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn out_of_reach_order_is_404() {
    let h = harness();
    let id = create_product_order(&h).await;

    let other = Some(("CEN-002", "center"));
    let (status, _) = call(&h, request("GET", &format!("/orders/{id}"), other, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let body = json!({ "policyVersion": 1 });
    let uri = format!("/orders/{id}/actions/cancel");
    let (status, _) = call(&h, request("POST", &uri, other, Some(body))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn destination_in_another_hierarchy_is_404() {
    let h = harness();
    let body = json!({
        "orderType": "product",
        "destinationId": "WH-001",
        "items": [{ "catalogCode": "PRD-MOP-01", "quantity": 1 }],
    });
    let other = Some(("CEN-002", "center"));

    let (status, json) = call(&h, request("POST", "/orders", other, Some(body))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");
}

#[tokio::test]
async fn action_lifecycle_over_http() {
    let h = harness();
    let id = create_product_order(&h).await;
    let uri = format!("/orders/{id}/actions/deliver");

    let stale = json!({ "policyVersion": 2 });
    let (status, json) = call(&h, request("POST", &uri, WAREHOUSE, Some(stale))).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(json["error"], "policy_version_mismatch");

    let current = json!({ "policyVersion": 1 });
    let (status, json) = call(&h, request("POST", &uri, WAREHOUSE, Some(current.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "delivered");
    assert_eq!(json["allowedActions"], json!(["view"]));

    let cancel = format!("/orders/{id}/actions/cancel");
    let (status, json) = call(&h, request("POST", &cancel, CENTER, Some(current))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "invalid_transition");
}

#[tokio::test]
async fn unknown_action_is_400() {
    let h = harness();
    let id = create_product_order(&h).await;
    let uri = format!("/orders/{id}/actions/teleport");

    let (status, _) = call(&h, request("POST", &uri, WAREHOUSE, Some(json!({ "policyVersion": 1 })))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// activity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feed_and_count_agree() {
    let h = harness();
    create_product_order(&h).await;

    let customer = Some(("CUS-001", "customer"));
    let (status, feed) = call(&h, request("GET", "/activity", customer, None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, count) = call(&h, request("GET", "/activity/count", customer, None)).await;
    assert_eq!(status, StatusCode::OK);

    let rows = feed.as_array().unwrap();
    assert!(!rows.is_empty());
    assert_eq!(count["count"].as_u64().unwrap() as usize, rows.len());

    let (status, _) = call(&h, request("GET", "/activity?scope=global", customer, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn dismiss_hides_a_row_for_that_viewer() {
    let h = harness();
    create_product_order(&h).await;

    let (_, feed) = call(&h, request("GET", "/activity", CENTER, None)).await;
    let before = feed.as_array().unwrap().len();
    let first = feed[0]["activityId"].as_str().unwrap().to_string();

    let uri = format!("/activity/{first}/dismiss");
    let outsider = Some(("CEN-002", "center"));
    let (status, json) = call(&h, request("POST", &uri, outsider, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"], "not_found");

    let (status, _) = call(&h, request("POST", &uri, CENTER, None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, feed) = call(&h, request("GET", "/activity", CENTER, None)).await;
    assert_eq!(feed.as_array().unwrap().len(), before - 1);

    let clear = format!("/admin/activity/{first}/clear");
    let (status, _) = call(&h, request("POST", &clear, CENTER, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, json) = call(&h, request("POST", &clear, ADMIN, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["clearedAt"].is_string());
}

// ---------------------------------------------------------------------------
// archive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn archive_is_admin_only() {
    let h = harness();
    let body = json!({ "entityType": "center", "entityId": "CEN-010" });

    let (status, json) = call(&h, request("POST", "/archive", CENTER, Some(body))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["error"], "forbidden");
}

#[tokio::test]
async fn archive_then_restore_over_http() {
    let h = harness();
    let body = json!({ "entityType": "center", "entityId": "CEN-010", "reason": "closed site" });

    let (status, json) = call(&h, request("POST", "/archive", ADMIN, Some(body.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["newlyArchived"], true);
    assert_eq!(json["archiveReason"], "closed site");

    let (status, json) = call(&h, request("POST", "/archive", ADMIN, Some(body))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["newlyArchived"], false);

    let (status, json) = call(&h, request("GET", "/archive?entityType=center", ADMIN, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["entityId"], "CEN-010");

    let restore = json!({ "entityType": "center", "entityId": "CEN-010" });
    let (status, json) = call(&h, request("POST", "/restore", ADMIN, Some(restore))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["restored"], true);
    assert_eq!(json["orphanedRelationships"], json!([]));
}

#[tokio::test]
async fn archive_of_missing_entity_is_404() {
    let h = harness();
    let body = json!({ "entityType": "center", "entityId": "CEN-404" });

    let (status, _) = call(&h, request("POST", "/archive", ADMIN, Some(body))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sweep_requires_admin() {
    let h = harness();

    let (status, _) = call(&h, request("POST", "/admin/hard-delete-sweep", WAREHOUSE, None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = call(&h, request("POST", "/admin/hard-delete-sweep", ADMIN, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["deleted"], json!([]));
    assert_eq!(json["failed"], 0);
}
