//! Axum router over the portal.
//!
//! `build_router` is the single entry point; the binary adds tracing and
//! serves it, tests drive it in-process. Caller identity arrives already
//! verified in the `x-user-id` / `x-user-role` headers.
//!
//! Every handler hands its portal work to `spawn_blocking`: sled calls block,
//! and the binary's background sweep runs the same way.
use crate::api_types::{
    ActionBody, ActivityBody, ActivityQuery, ArchiveListQuery, ArchiveRequest, ArchiveResponse,
    ArchivedBody, CountResponse, CreateOrderRequest, ErrorResponse, HealthResponse, OrderResponse,
    OrderSummary, RequestCrewBody, RestoreRequest, RestoreResponse, SweepResponse,
};
use crate::error::PortalError;
use crate::executor::ActionRequest;
use crate::order::OrderDraft;
use crate::policy::{OrderAction, PolicyVersion};
use crate::portal::Portal;
use crate::types::{Actor, EntityRef, Role};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::error;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

pub struct AppState {
    pub portal: Portal,
    pub feed_limit: usize,
}

impl AppState {
    pub fn new(portal: Portal, feed_limit: usize) -> Self {
        Self { portal, feed_limit }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/orders", get(list_orders).post(create_order))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/actions/:action", post(apply_action))
        .route("/orders/:id/crew", post(request_crew))
        .route("/activity", get(activity_feed))
        .route("/activity/count", get(activity_count))
        .route("/activity/:id/dismiss", post(dismiss_activity))
        .route("/admin/activity/:id/clear", post(clear_activity))
        .route("/archive", get(list_archived).post(archive))
        .route("/restore", post(restore))
        .route("/admin/hard-delete-sweep", post(hard_delete_sweep))
        .with_state(state)
}

/// A failure on its way out as an HTTP response.
pub enum ApiError {
    Portal(PortalError),
    /// The blocking task panicked or was cancelled.
    Task(JoinError),
}

impl From<PortalError> for ApiError {
    fn from(value: PortalError) -> Self {
        ApiError::Portal(value)
    }
}

fn internal() -> Response {
    let body = ErrorResponse {
        error: "internal",
        message: "internal error".into(),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Portal(err) => err,
            ApiError::Task(e) => {
                error!(error = %e, "portal task failed");
                return internal();
            }
        };
        let (status, code) = match &err {
            PortalError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            PortalError::InvalidTransition(_) => (StatusCode::FORBIDDEN, "invalid_transition"),
            PortalError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            PortalError::StaleState { .. } => (StatusCode::CONFLICT, "stale_state"),
            PortalError::PolicyVersionMismatch { .. } => (StatusCode::GONE, "policy_version_mismatch"),
            PortalError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            PortalError::DependentDeleteFailure { .. }
            | PortalError::Storage(_)
            | PortalError::Codec(_) => {
                error!(error = %err, "request failed");
                return internal();
            }
        };
        let body = ErrorResponse {
            error: code,
            message: err.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Run `work` against the portal on the blocking pool.
async fn blocking<T, F>(st: &Arc<AppState>, work: F) -> Result<T, ApiError>
where
    F: FnOnce(&AppState) -> Result<T, PortalError> + Send + 'static,
    T: Send + 'static,
{
    let st = Arc::clone(st);
    tokio::task::spawn_blocking(move || work(&st))
        .await
        .map_err(ApiError::Task)?
        .map_err(ApiError::Portal)
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str, PortalError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| PortalError::InvalidInput(format!("missing '{name}' header")))
}

pub fn actor_from(headers: &HeaderMap) -> Result<Actor, PortalError> {
    let user_id = header(headers, USER_ID_HEADER)?;
    let role: Role = header(headers, USER_ROLE_HEADER)?.parse()?;
    Ok(Actor::new(user_id, role))
}

fn admin_from(headers: &HeaderMap) -> Result<Actor, PortalError> {
    let actor = actor_from(headers)?;
    if !actor.is_admin() {
        return Err(PortalError::Forbidden("admin only".into()));
    }
    Ok(actor)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: env!("CARGO_PKG_NAME"),
        }),
    )
}

async fn list_orders(State(st): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<Vec<OrderSummary>> {
    let actor = actor_from(&headers)?;
    let orders = blocking(&st, move |st| {
        let mut scope = st.portal.resolver.scope();
        st.portal.orders.list_visible(&actor, &mut scope)
    })
    .await?;
    Ok(Json(orders.iter().map(OrderSummary::from).collect()))
}

async fn create_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let actor = actor_from(&headers)?;
    let draft = OrderDraft {
        order_type: body.order_type,
        destination_id: body.destination_id,
        requested_date: body.requested_date.map(Into::into),
        crew_id: body.crew_id,
        items: body.items,
    };
    let state = blocking(&st, move |st| st.portal.orders.create_order(draft, &actor)).await?;
    Ok((StatusCode::CREATED, Json(state.into())))
}

async fn get_order(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<OrderResponse> {
    let actor = actor_from(&headers)?;
    let state = blocking(&st, move |st| {
        let mut scope = st.portal.resolver.scope();
        st.portal.orders.view(&id, &actor, &mut scope)
    })
    .await?;
    Ok(Json(state.into()))
}

async fn apply_action(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, action)): Path<(String, String)>,
    Json(body): Json<ActionBody>,
) -> ApiResult<OrderResponse> {
    let actor = actor_from(&headers)?;
    let action: OrderAction = action.parse()?;
    let state = blocking(&st, move |st| {
        // unknown or hidden orders read as missing before any policy answer
        let mut scope = st.portal.resolver.scope();
        st.portal.orders.view(&id, &actor, &mut scope)?;
        let req = ActionRequest::new(id, actor, action).at_version(PolicyVersion(body.policy_version));
        st.portal.orders.apply_action(&req)
    })
    .await?;
    Ok(Json(state.into()))
}

async fn request_crew(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RequestCrewBody>,
) -> ApiResult<OrderResponse> {
    let actor = actor_from(&headers)?;
    let state = blocking(&st, move |st| st.portal.orders.request_crew(&id, &body.crew_id, &actor)).await?;
    Ok(Json(state.into()))
}

async fn activity_feed(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ActivityQuery>,
) -> ApiResult<Vec<ActivityBody>> {
    let actor = actor_from(&headers)?;
    match q.scope.as_deref() {
        None | Some("ecosystem") => {}
        Some(other) => {
            return Err(PortalError::InvalidInput(format!("unknown activity scope '{other}'")).into());
        }
    }
    let limit = q.limit.unwrap_or(st.feed_limit).clamp(1, st.feed_limit);
    let feed = blocking(&st, move |st| {
        let mut scope = st.portal.resolver.scope();
        st.portal.activity.feed(&actor, &mut scope, limit)
    })
    .await?;
    Ok(Json(feed.into_iter().map(ActivityBody::from).collect()))
}

async fn activity_count(State(st): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<CountResponse> {
    let actor = actor_from(&headers)?;
    let count = blocking(&st, move |st| {
        let mut scope = st.portal.resolver.scope();
        st.portal.activity.count(&actor, &mut scope)
    })
    .await?;
    Ok(Json(CountResponse { count }))
}

async fn dismiss_activity(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let actor = actor_from(&headers)?;
    blocking(&st, move |st| {
        let mut scope = st.portal.resolver.scope();
        st.portal.activity.dismiss(&id, &actor, &mut scope)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_activity(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<ActivityBody> {
    let admin = admin_from(&headers)?;
    let cleared = blocking(&st, move |st| st.portal.activity.clear(&id, &admin)).await?;
    Ok(Json(cleared.into()))
}

async fn archive(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ArchiveRequest>,
) -> ApiResult<ArchiveResponse> {
    let admin = admin_from(&headers)?;
    let node = EntityRef::new(body.entity_type, body.entity_id);
    let outcome = blocking(&st, move |st| st.portal.archive.archive(&node, body.reason, &admin)).await?;
    Ok(Json(outcome.into()))
}

async fn restore(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RestoreRequest>,
) -> ApiResult<RestoreResponse> {
    let admin = admin_from(&headers)?;
    let node = EntityRef::new(body.entity_type, body.entity_id);
    let outcome = blocking(&st, move |st| st.portal.archive.restore(&node, &admin)).await?;
    Ok(Json(outcome.into()))
}

async fn list_archived(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<ArchiveListQuery>,
) -> ApiResult<Vec<ArchivedBody>> {
    admin_from(&headers)?;
    let items = blocking(&st, move |st| st.portal.archive.list_archived(q.entity_type)).await?;
    Ok(Json(items.into_iter().map(ArchivedBody::from).collect()))
}

async fn hard_delete_sweep(State(st): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult<SweepResponse> {
    let admin = admin_from(&headers)?;
    let report = blocking(&st, move |st| st.portal.archive.hard_delete_sweep(&admin)).await?;
    Ok(Json(report.into()))
}
