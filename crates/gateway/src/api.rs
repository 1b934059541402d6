//! HTTP API for order-lifecycle operations.
//!
//! Endpoints:
//! - `POST /order` - Place an order
//! - `PUT /order/{order_id}` - Modify price/amount of an open order
//! - `DELETE /order/{order_id}` - Cancel an order
//! - `GET /order/{order_id}` - Order state
//! - `GET /orders` - All open orders
//! - `GET /orderbook/{instrument}` - Top of book
//! - `GET /instrument/{name}` - Instrument details
//! - `GET /instruments?currency=BTC&kind=future` - Active instruments
//! - `GET /positions/{currency}` - Open positions
//!
//! Every handler enqueues through the dispatcher and awaits the request's
//! one-shot handle; the exchange's JSON response is returned verbatim.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use deribit::{Dispatcher, Error, RpcHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

/// State shared across the API handlers.
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
}

/// Create the order-lifecycle router.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/order", post(place_order_handler))
        .route(
            "/order/{order_id}",
            get(order_state_handler)
                .put(modify_order_handler)
                .delete(cancel_order_handler),
        )
        .route("/orders", get(active_orders_handler))
        .route("/orderbook/{instrument}", get(orderbook_handler))
        .route("/instrument/{name}", get(instrument_handler))
        .route("/instruments", get(instruments_handler))
        .route("/positions/{currency}", get(positions_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// API error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

fn error_response(e: &Error) -> (StatusCode, Json<Value>) {
    let (status, code) = match e {
        Error::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
        Error::Auth(_) => (StatusCode::BAD_GATEWAY, "AUTH_FAILED"),
        Error::Transport(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_UNREACHABLE"),
        Error::Protocol(_) => (StatusCode::BAD_GATEWAY, "BAD_UPSTREAM_RESPONSE"),
        Error::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
        Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MISCONFIGURED"),
    };
    error!("Order API request failed: {}", e);
    let body = serde_json::to_value(ErrorResponse {
        error: e.to_string(),
        code: code.to_string(),
    })
    .unwrap_or_default();
    (status, Json(body))
}

async fn complete(handle: RpcHandle) -> (StatusCode, Json<Value>) {
    match handle.wait().await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(e) => error_response(&e),
    }
}

/// Order placement request body.
#[derive(Deserialize)]
struct PlaceOrderBody {
    instrument: String,
    side: String,
    #[serde(rename = "type", default = "default_order_type")]
    order_type: String,
    amount: f64,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    reduce_only: bool,
}

fn default_order_type() -> String {
    "market".to_string()
}

/// POST /order
async fn place_order_handler(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PlaceOrderBody>,
) -> impl IntoResponse {
    match state.dispatcher.place_order(
        &body.instrument,
        &body.side,
        &body.order_type,
        body.amount,
        body.price,
        body.reduce_only,
    ) {
        Ok(handle) => complete(handle).await,
        Err(e) => error_response(&e),
    }
}

/// Order modification request body.
#[derive(Deserialize)]
struct ModifyOrderBody {
    price: f64,
    amount: f64,
}

/// PUT /order/{order_id}
async fn modify_order_handler(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<String>,
    Json(body): Json<ModifyOrderBody>,
) -> impl IntoResponse {
    complete(
        state
            .dispatcher
            .modify_order(&order_id, body.price, body.amount),
    )
    .await
}

/// DELETE /order/{order_id}
async fn cancel_order_handler(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    complete(state.dispatcher.cancel_order(&order_id)).await
}

/// GET /order/{order_id}
async fn order_state_handler(
    State(state): State<Arc<ApiState>>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    complete(state.dispatcher.get_order_state(&order_id)).await
}

/// GET /orders
async fn active_orders_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    complete(state.dispatcher.get_active_orders()).await
}

/// GET /orderbook/{instrument}
async fn orderbook_handler(
    State(state): State<Arc<ApiState>>,
    Path(instrument): Path<String>,
) -> impl IntoResponse {
    complete(state.dispatcher.get_orderbook(&instrument)).await
}

/// GET /instrument/{name}
async fn instrument_handler(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    complete(state.dispatcher.get_instrument(&name)).await
}

/// Instrument listing query.
#[derive(Deserialize)]
struct InstrumentsQuery {
    currency: String,
    kind: String,
}

/// GET /instruments?currency=BTC&kind=future
async fn instruments_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<InstrumentsQuery>,
) -> impl IntoResponse {
    complete(state.dispatcher.get_instruments(&query.currency, &query.kind)).await
}

/// GET /positions/{currency}
async fn positions_handler(
    State(state): State<Arc<ApiState>>,
    Path(currency): Path<String>,
) -> impl IntoResponse {
    complete(state.dispatcher.get_positions(&currency)).await
}
