//! # PayPal Provider
//!
//! `PaymentProvider` over PayPal's Orders v2, Payments v2 and Billing v1
//! APIs. Payments are orders the payer approves on PayPal before they can be
//! captured; the approval link is returned in the snapshot.

use crate::config::PayPalConfig;
use crate::token::{FetchedToken, TokenCache};
use crate::types::{
    ApplicationContext, CreateOrderBody, CreateSubscriptionBody, PayPalErrorResponse,
    PayPalMoney, PayPalOrder, PayPalPaymentObject, PayPalPlan, PayPalRefund, PayPalSubscription,
    PayPalTokenResponse, PurchaseUnitRequest, RefundBody, VerifySignatureResponse,
};
use crate::webhook::{self, Transmission, PAYPAL_EVENTS};
use async_trait::async_trait;
use pay_core::{
    CaptureResult, CreateCustomerRequest, CreatePaymentRequest, CreateSubscriptionRequest,
    Customer, EventTableEntry, PaymentError, PaymentProvider, PaymentResult, PaymentSnapshot,
    ProviderName, RefundRequest, RefundResult, ResourceKind, ResourceSnapshot,
    SubscriptionSnapshot, WebhookEvent, WebhookHeaders,
};
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

const PAYPAL: ProviderName = ProviderName::PayPal;

/// Error code reported when a refund is requested for an order with no capture
pub const CAPTURE_NOT_FOUND: &str = "capture_not_found";

/// PayPal payment provider
pub struct PayPalProvider {
    config: PayPalConfig,
    client: Client,
    token: TokenCache,
}

impl PayPalProvider {
    pub fn new(config: PayPalConfig) -> PaymentResult<Self> {
        let client = Client::builder().build().map_err(|e| {
            PaymentError::Configuration(format!("Failed to create HTTP client: {e}"))
        })?;
        let token = TokenCache::new(config.token_refresh_margin);

        Ok(Self {
            config,
            client,
            token,
        })
    }

    /// Create from environment variables
    pub fn from_env() -> PaymentResult<Self> {
        Self::new(PayPalConfig::from_env()?)
    }

    pub fn config(&self) -> &PayPalConfig {
        &self.config
    }

    async fn fetch_token(&self) -> PaymentResult<FetchedToken> {
        let (Some(client_id), Some(secret)) =
            (&self.config.client_id, &self.config.client_secret)
        else {
            return Err(PaymentError::Configuration(
                "PAYPAL_CLIENT_ID / PAYPAL_CLIENT_SECRET not set".to_string(),
            ));
        };

        let response = self
            .client
            .post(format!("{}/v1/oauth2/token", self.config.api_base_url))
            .basic_auth(client_id, Some(secret.expose_secret()))
            .form(&[("grant_type", "client_credentials")])
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            error!("PayPal token request failed: status={}", status);
            return Err(api_error(status, &body));
        }

        let token: PayPalTokenResponse = serde_json::from_str(&body).map_err(|e| {
            PaymentError::Serialization(format!("Failed to parse PayPal token: {}", e))
        })?;
        Ok(FetchedToken {
            value: token.access_token,
            expires_in_secs: token.expires_in,
        })
    }

    /// Send an authenticated JSON request and return the raw response body.
    async fn execute<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        request_id: Option<&str>,
    ) -> PaymentResult<String> {
        let token = self.token.get_or_refresh(|| self.fetch_token()).await?;

        let mut request = self
            .client
            .request(method, format!("{}{}", self.config.api_base_url, path))
            .bearer_auth(token)
            .header("Prefer", "return=representation")
            .timeout(self.config.request_timeout);

        if let Some(id) = request_id {
            request = request.header("PayPal-Request-Id", id);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if status == StatusCode::UNAUTHORIZED {
            warn!("PayPal rejected the access token; it will be refetched");
            self.token.invalidate().await;
        }
        if !status.is_success() {
            error!("PayPal API error: status={}, path={}", status, path);
            return Err(api_error(status, &text));
        }
        Ok(text)
    }

    async fn call<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        request_id: Option<&str>,
    ) -> PaymentResult<T> {
        let text = self.execute(method, path, body, request_id).await?;
        serde_json::from_str(&text).map_err(|e| {
            PaymentError::Serialization(format!("Failed to parse PayPal response: {}", e))
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> PaymentResult<T> {
        self.call::<T, ()>(Method::GET, path, None, None).await
    }

    async fn get_order(&self, order_id: &str) -> PaymentResult<PayPalOrder> {
        self.get(&format!("/v2/checkout/orders/{}", order_id)).await
    }

    async fn get_subscription(&self, id: &str) -> PaymentResult<PayPalSubscription> {
        self.get(&format!("/v1/billing/subscriptions/{}", id)).await
    }

    async fn get_plan(&self, plan_id: &str) -> PaymentResult<PayPalPlan> {
        self.get(&format!("/v1/billing/plans/{}", plan_id)).await
    }

    /// Capture an AUTHORIZE-intent order through its authorization
    async fn capture_authorization(&self, order: PayPalOrder) -> PaymentResult<CaptureResult> {
        let authorization_id = match order.open_authorization_id() {
            Some(id) => id.to_string(),
            None => {
                let authorized: PayPalOrder = self
                    .call::<_, ()>(
                        Method::POST,
                        &format!("/v2/checkout/orders/{}/authorize", order.id),
                        None,
                        None,
                    )
                    .await?;
                authorized
                    .open_authorization_id()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        PaymentError::provider(
                            PAYPAL,
                            format!("order {} returned no authorization", order.id),
                        )
                    })?
            }
        };

        let capture: PayPalPaymentObject = self
            .call::<_, ()>(
                Method::POST,
                &format!("/v2/payments/authorizations/{}/capture", authorization_id),
                None,
                None,
            )
            .await?;
        capture.into_capture_result()
    }
}

fn transport_error(e: reqwest::Error) -> PaymentError {
    PaymentError::transport(PAYPAL, e.to_string(), e.is_timeout())
}

fn api_error(status: StatusCode, body: &str) -> PaymentError {
    let (code, message) = match serde_json::from_str::<PayPalErrorResponse>(body) {
        Ok(parsed) => (
            parsed
                .details
                .iter()
                .find_map(|d| d.issue.clone())
                .or(parsed.name),
            parsed.message.unwrap_or_else(|| format!("HTTP {status}")),
        ),
        Err(_) => (None, format!("HTTP {}: {}", status, body)),
    };
    PaymentError::Provider {
        provider: PAYPAL,
        code,
        message,
        status: Some(status.as_u16()),
    }
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn name(&self) -> ProviderName {
        PAYPAL
    }

    fn is_configured(&self) -> bool {
        self.config.has_credentials()
    }

    #[instrument(skip(self, request), fields(amount = %request.amount, currency = %request.currency))]
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> PaymentResult<PaymentSnapshot> {
        let body = CreateOrderBody {
            intent: if request.capture { "CAPTURE" } else { "AUTHORIZE" },
            purchase_units: vec![PurchaseUnitRequest {
                amount: PayPalMoney::from_decimal(request.amount, &request.currency),
                description: request.description.clone(),
                custom_id: request.customer.clone(),
            }],
            application_context: ApplicationContext::from_urls(
                &request.return_url,
                &request.cancel_url,
            ),
        };

        let order: PayPalOrder = self
            .call(
                Method::POST,
                "/v2/checkout/orders",
                Some(&body),
                request.idempotency_key.as_deref(),
            )
            .await?;

        info!("Created PayPal order: id={}, status={}", order.id, order.status);
        order.into_snapshot()
    }

    #[instrument(skip(self))]
    async fn capture_payment(&self, provider_payment_id: &str) -> PaymentResult<CaptureResult> {
        let order = self.get_order(provider_payment_id).await?;

        let result = if order.is_authorize_intent() {
            self.capture_authorization(order).await?
        } else {
            let captured: PayPalOrder = self
                .call::<_, ()>(
                    Method::POST,
                    &format!("/v2/checkout/orders/{}/capture", provider_payment_id),
                    None,
                    None,
                )
                .await?;
            captured.into_capture_result()?
        };

        info!(
            "Captured PayPal order: id={}, capture={:?}",
            provider_payment_id, result.capture_id
        );
        Ok(result)
    }

    #[instrument(skip(self, request), fields(payment = %request.provider_payment_id))]
    async fn refund_payment(&self, request: &RefundRequest) -> PaymentResult<RefundResult> {
        let order = self.get_order(&request.provider_payment_id).await?;
        let capture_id = order.refundable_capture_id().ok_or_else(|| PaymentError::Provider {
            provider: PAYPAL,
            code: Some(CAPTURE_NOT_FOUND.to_string()),
            message: format!("order {} has no capture to refund", order.id),
            status: None,
        })?;

        let body = RefundBody {
            amount: request
                .amount
                .map(|amount| PayPalMoney::from_decimal(amount, &request.currency)),
        };
        let refund: PayPalRefund = self
            .call(
                Method::POST,
                &format!("/v2/payments/captures/{}/refund", capture_id),
                Some(&body),
                request.idempotency_key.as_deref(),
            )
            .await?;

        info!("Created PayPal refund: id={}, status={}", refund.id, refund.status);
        refund.into_result()
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, provider_payment_id: &str) -> PaymentResult<PaymentSnapshot> {
        let order = self.get_order(provider_payment_id).await?;
        debug!("Fetched PayPal order: id={}, status={}", order.id, order.status);
        order.into_snapshot()
    }

    #[instrument(skip(self, request), fields(plan = %request.plan_id))]
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> PaymentResult<SubscriptionSnapshot> {
        let terms = self.get_plan(&request.plan_id).await?.regular_terms()?;

        let body = CreateSubscriptionBody {
            plan_id: request.plan_id.clone(),
            custom_id: request.customer.clone(),
            start_time: request.billing_cycle_anchor.or(request.trial_end),
            application_context: ApplicationContext::from_urls(
                &request.return_url,
                &request.cancel_url,
            ),
        };

        let subscription: PayPalSubscription = self
            .call(
                Method::POST,
                "/v1/billing/subscriptions",
                Some(&body),
                request.idempotency_key.as_deref(),
            )
            .await?;

        info!(
            "Created PayPal subscription: id={}, status={}",
            subscription.id, subscription.status
        );
        subscription.into_snapshot(Some(terms))
    }

    #[instrument(skip(self))]
    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> PaymentResult<SubscriptionSnapshot> {
        let reason = serde_json::json!({ "reason": "Canceled by merchant" });
        self.execute(
            Method::POST,
            &format!("/v1/billing/subscriptions/{}/cancel", provider_subscription_id),
            Some(&reason),
            None,
        )
        .await?;

        let subscription = self.get_subscription(provider_subscription_id).await?;
        info!(
            "Canceled PayPal subscription: id={}, status={}",
            subscription.id, subscription.status
        );
        subscription.into_snapshot(None)
    }

    async fn create_customer(&self, _request: &CreateCustomerRequest) -> PaymentResult<Customer> {
        Err(PaymentError::Unsupported {
            provider: PAYPAL,
            operation: "create_customer",
        })
    }

    #[instrument(skip(self, payload, headers))]
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> PaymentResult<WebhookEvent> {
        let webhook_id = self.config.webhook_id.as_deref().ok_or_else(|| {
            PaymentError::Configuration("PAYPAL_WEBHOOK_ID not set".to_string())
        })?;
        let transmission = Transmission::from_headers(headers)?;
        let event = webhook::decode_payload(payload)?;

        let verification: VerifySignatureResponse = self
            .call(
                Method::POST,
                "/v1/notifications/verify-webhook-signature",
                Some(&transmission.verification_body(webhook_id, event)),
                None,
            )
            .await?;

        if verification.verification_status != "SUCCESS" {
            return Err(PaymentError::SignatureInvalid(format!(
                "PayPal reported verification_status={}",
                verification.verification_status
            )));
        }

        debug!("Verified PayPal webhook: transmission={}", transmission.id);
        webhook::parse_event(event)
    }

    fn parse_resource(
        &self,
        kind: ResourceKind,
        resource: &serde_json::Value,
    ) -> PaymentResult<ResourceSnapshot> {
        webhook::parse_resource(kind, resource)
    }

    fn event_table(&self) -> &'static [EventTableEntry] {
        PAYPAL_EVENTS
    }
}
