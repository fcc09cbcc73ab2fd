//! # Request Handlers
//!
//! Axum request handlers for the payment gateway API. Every handler resolves
//! the `{provider}` path segment, delegates to the reconciliation engine and
//! maps `PaymentError` to an HTTP status via `PaymentError::status_code`.

use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use pay_core::{
    CreateCustomerRequest, CreatePaymentRequest, CreateSubscriptionRequest, Customer,
    GatewayStatistics, PaymentError, PaymentRecord, ProviderName, RefundOutcome,
    RefundPaymentRequest, SubscriptionRecord, WebhookHeaders, WebhookReceipt,
};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

// =============================================================================
// Error Responses
// =============================================================================

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<T, ApiError>;

fn payment_error_to_response(err: PaymentError) -> ApiError {
    let code = err.status_code();
    let mut response = ErrorResponse::new(err.to_string(), code);
    if let PaymentError::Provider {
        code: Some(ref provider_code),
        ..
    } = err
    {
        response = response.with_details(provider_code.clone());
    }
    (
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(response),
    )
}

fn parse_provider(name: &str) -> ApiResult<ProviderName> {
    name.parse().map_err(|_| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(
                format!("Unknown payment provider: {}", name),
                404,
            )),
        )
    })
}

/// Copy request headers; values that are not valid UTF-8 cannot carry a signature
fn webhook_headers(headers: &HeaderMap) -> WebhookHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

// =============================================================================
// Health & Statistics
// =============================================================================

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "pay-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.engine.provider_statuses(),
    }))
}

/// Ledger statistics
pub async fn statistics(State(state): State<AppState>) -> ApiResult<Json<GatewayStatistics>> {
    state
        .engine
        .statistics()
        .map(Json)
        .map_err(payment_error_to_response)
}

// =============================================================================
// Payments
// =============================================================================

#[instrument(skip(state, request), fields(amount = %request.amount, currency = %request.currency))]
pub async fn create_payment(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(request): Json<CreatePaymentRequest>,
) -> ApiResult<(StatusCode, Json<PaymentRecord>)> {
    let provider = parse_provider(&provider)?;

    let record = state
        .engine
        .create_payment(provider, &request)
        .await
        .map_err(|e| {
            error!("Failed to create payment: {}", e);
            payment_error_to_response(e)
        })?;

    info!("Created payment: {}:{}", provider, record.provider_payment_id);
    Ok((StatusCode::CREATED, Json(record)))
}

/// Refresh a payment from the provider and return the stored row
#[instrument(skip(state))]
pub async fn get_payment(
    State(state): State<AppState>,
    Path((provider, payment_id)): Path<(String, String)>,
) -> ApiResult<Json<PaymentRecord>> {
    let provider = parse_provider(&provider)?;

    state
        .engine
        .sync_payment(provider, &payment_id)
        .await
        .map(Json)
        .map_err(payment_error_to_response)
}

#[instrument(skip(state))]
pub async fn capture_payment(
    State(state): State<AppState>,
    Path((provider, payment_id)): Path<(String, String)>,
) -> ApiResult<Json<PaymentRecord>> {
    let provider = parse_provider(&provider)?;

    state
        .engine
        .capture_payment(provider, &payment_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to capture payment: {}", e);
            payment_error_to_response(e)
        })
}

#[instrument(skip(state, request))]
pub async fn refund_payment(
    State(state): State<AppState>,
    Path((provider, payment_id)): Path<(String, String)>,
    Json(request): Json<RefundPaymentRequest>,
) -> ApiResult<Json<RefundOutcome>> {
    let provider = parse_provider(&provider)?;

    state
        .engine
        .refund_payment(provider, &payment_id, &request)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to refund payment: {}", e);
            payment_error_to_response(e)
        })
}

// =============================================================================
// Subscriptions & Customers
// =============================================================================

#[instrument(skip(state, request), fields(plan = %request.plan_id))]
pub async fn create_subscription(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(request): Json<CreateSubscriptionRequest>,
) -> ApiResult<(StatusCode, Json<SubscriptionRecord>)> {
    let provider = parse_provider(&provider)?;

    let record = state
        .engine
        .create_subscription(provider, &request)
        .await
        .map_err(|e| {
            error!("Failed to create subscription: {}", e);
            payment_error_to_response(e)
        })?;

    Ok((StatusCode::CREATED, Json(record)))
}

#[instrument(skip(state))]
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path((provider, subscription_id)): Path<(String, String)>,
) -> ApiResult<Json<SubscriptionRecord>> {
    let provider = parse_provider(&provider)?;

    state
        .engine
        .cancel_subscription(provider, &subscription_id)
        .await
        .map(Json)
        .map_err(payment_error_to_response)
}

#[instrument(skip(state, request))]
pub async fn create_customer(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(request): Json<CreateCustomerRequest>,
) -> ApiResult<(StatusCode, Json<Customer>)> {
    let provider = parse_provider(&provider)?;

    let customer = state
        .engine
        .create_customer(provider, &request)
        .await
        .map_err(payment_error_to_response)?;

    Ok((StatusCode::CREATED, Json(customer)))
}

// =============================================================================
// Webhooks
// =============================================================================

/// Inbound provider webhook. The body is taken as raw bytes so signatures
/// are checked against exactly what the provider sent.
#[instrument(skip(state, headers, body), fields(bytes = body.len()))]
pub async fn webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookReceipt>> {
    let provider = parse_provider(&provider)?;

    let receipt = state
        .engine
        .handle_webhook(provider, &body, &webhook_headers(&headers))
        .await
        .map_err(|e| {
            warn!("Webhook rejected: provider={}, error={}", provider, e);
            payment_error_to_response(e)
        })?;

    Ok(Json(receipt))
}
