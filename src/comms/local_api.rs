use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ApiError, ConfigError};
use crate::inventory::models::{
    ExtremeQuery, ListQuery, LoginRequest, LoginResponse, NewProduct, ProductIdQuery, QuantityUpdateRequest,
    RegisterRequest,
};
use crate::inventory::store::DEFAULT_PAGE_SIZE;
use crate::inventory::{Extreme, InventoryStore, StoreError};
use crate::security::audit_log::AuditLogger;
use crate::security::rate_limit::spawn_bucket_sweeper;
use crate::security::{Admission, AdmissionControl, AuthGate, CredentialValidator, Identity, RateLimiter};
use crate::utils::clock::{SharedClock, SystemClock};

type SharedState = Arc<AppState>;

const UNKNOWN_CLIENT: &str = "unknown";

// Rate-limit key: the peer address, or the first forwarded address when the
// deployment sits behind a trusted proxy.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

impl FromRequestParts<SharedState> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        if state.config.trust_forwarded_headers {
            if let Some(ip) = forwarded_ip(parts) {
                return Ok(ClientIp(ip));
            }
        }
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientIp(addr.ip().to_string()));
        }
        Ok(ClientIp(UNKNOWN_CLIENT.to_string()))
    }
}

fn forwarded_ip(parts: &Parts) -> Option<String> {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .filter(|s| !s.is_empty())
    };
    header("x-forwarded-for").or_else(|| header("x-real-ip"))
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub limiter: Arc<dyn AdmissionControl>,
    pub validator: CredentialValidator,
    pub gate: AuthGate,
    pub store: InventoryStore,
    pub audit: AuditLogger,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Result<Self, ConfigError> {
        Self::with_clock(config, SystemClock::shared())
    }

    /// Validates `config` and wires every component to the same clock.
    pub fn with_clock(config: Arc<Config>, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = RateLimiter::new(config.bucket_config()?, clock.clone());
        let validator = CredentialValidator::new(
            config.signing_secret()?,
            config.auth.issuer.clone(),
            config.token_lifetime()?,
            clock,
        );
        Ok(Self {
            limiter: Arc::new(limiter),
            gate: AuthGate::new(validator.clone()),
            validator,
            store: InventoryStore::new(),
            audit: AuditLogger::new(),
            config,
        })
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidRegistration => ApiError::BadRequest("Invalid input".into()),
            StoreError::DuplicateUsername => ApiError::Conflict("Username already in use".into()),
            StoreError::UnknownUser => ApiError::NotFound("User not found".into()),
            StoreError::InvalidPassword => ApiError::InvalidCredentials,
            StoreError::InvalidProduct => ApiError::BadRequest("Invalid product fields".into()),
            StoreError::InvalidQuantity => ApiError::BadRequest("Quantity invalid".into()),
            StoreError::ProductNotFound => ApiError::NotFound("Product not found".into()),
            StoreError::Hashing(e) => {
                error!("password hashing failed: {}", e);
                ApiError::Internal
            }
        }
    }
}

fn invalid_input<E: std::fmt::Display>(err: E) -> ApiError {
    debug!("rejected request input: {}", err);
    ApiError::BadRequest("Invalid input".into())
}

// Outermost gate: every route, public or not, spends a token first.
async fn rate_limit(
    State(state): State<SharedState>,
    ClientIp(client): ClientIp,
    req: Request,
    next: Next,
) -> Response {
    match state.limiter.admit(&client) {
        Admission::Admitted => next.run(req).await,
        Admission::Rejected => {
            state.audit.rate_limited(&client, req.uri().path());
            ApiError::RateLimited.into_response()
        }
    }
}

// Only mounted on identity-requiring routes, after the limiter.
async fn require_identity(
    State(state): State<SharedState>,
    ClientIp(client): ClientIp,
    mut req: Request,
    next: Next,
) -> Response {
    match state.gate.authenticate(req.headers()) {
        Ok(identity) => {
            state.audit.auth_success(&client, &identity.user_id, req.uri().path());
            req.extensions_mut().insert(identity);
            next.run(req).await
        }
        Err(e) => {
            state.audit.auth_failure(&client, e.reason(), &e.to_string());
            ApiError::Unauthorized.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn register(
    State(state): State<SharedState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload.map_err(invalid_input)?;
    let user = state.store.register(&req.username, &req.password, req.email).await?;
    info!(user_id = %user.user_id, "registered user {}", user.username);
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login(
    State(state): State<SharedState>,
    ClientIp(client): ClientIp,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(req) = payload.map_err(invalid_input)?;
    let user = match state.store.authenticate(&req.username, &req.password).await {
        Ok(user) => user,
        Err(e) => {
            state.audit.login_failed(&client, &req.username, &e.to_string());
            return Err(e.into());
        }
    };
    let access_token = state
        .validator
        .issue(user.user_id, &user.username)
        .map_err(|e| {
            state.audit.internal_error(&client, &e.to_string());
            ApiError::Internal
        })?;
    state.audit.token_issued(&client, &user.user_id);
    Ok(Json(LoginResponse { access_token }))
}

async fn whoami(identity: Identity) -> Json<Identity> {
    Json(identity)
}

async fn insert_product(
    State(state): State<SharedState>,
    identity: Identity,
    payload: Result<Json<NewProduct>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(new) = payload.map_err(invalid_input)?;
    let product = state.store.insert_product(identity.user_id, new).await?;
    info!(product_id = %product.id, user_id = %identity.user_id, "product inserted");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Product inserted successfully",
            "product_id": product.id,
        })),
    ))
}

async fn update_quantity(
    State(state): State<SharedState>,
    identity: Identity,
    Path(id): Path<String>,
    payload: Result<Json<QuantityUpdateRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(input) = payload.map_err(invalid_input)?;
    let id = Uuid::parse_str(&id).map_err(|_| ApiError::NotFound("Product not found".into()))?;
    let product = state.store.update_quantity(identity.user_id, id, input.quantity).await?;
    info!(product_id = %product.id, quantity = product.quantity, "product quantity updated");
    Ok(Json(product))
}

async fn list_products(
    State(state): State<SharedState>,
    identity: Identity,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(q) = query.map_err(invalid_input)?;
    let page = q.pagenum.filter(|p| *p > 0).unwrap_or(1) as usize;
    let limit = q
        .limit
        .filter(|l| *l > 0)
        .map(|l| l as usize)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let products = state.store.list_products(identity.user_id, page, limit).await;
    debug!(user_id = %identity.user_id, count = products.len(), "listed products");
    Ok(Json(products))
}

async fn product_by_id(
    State(state): State<SharedState>,
    identity: Identity,
    Query(q): Query<ProductIdQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let raw = q
        .product_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("product_id query parameter is required".into()))?;
    let id = Uuid::parse_str(&raw).map_err(|_| ApiError::BadRequest("Invalid product_id format".into()))?;
    Ok(Json(state.store.get_product(identity.user_id, id).await?))
}

async fn product_by_quantity(
    State(state): State<SharedState>,
    identity: Identity,
    query: Result<Query<ExtremeQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(q) = query.map_err(invalid_input)?;
    // most wins when both are set
    let which = match (q.most, q.least) {
        (true, _) => Extreme::Most,
        (false, true) => Extreme::Least,
        (false, false) => {
            return Err(ApiError::BadRequest(
                "Provide either 'most=true' or 'least=true' in query".into(),
            ))
        }
    };
    Ok(Json(state.store.quantity_extreme(identity.user_id, which).await?))
}

pub fn create_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/products", post(insert_product).get(list_products))
        .route("/products/{id}/quantity", put(update_quantity))
        .route("/products/by-id", get(product_by_id))
        .route("/products/quantity", get(product_by_quantity))
        .route("/me", get(whoami))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_identity));

    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/login", post(login))
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(Arc::new(config))?);

    spawn_bucket_sweeper(state.limiter.clone(), state.config.sweep_interval()?);

    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
