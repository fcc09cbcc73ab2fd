//! # Stripe Provider
//!
//! `PaymentProvider` over the Stripe REST API: PaymentIntents for one-off
//! payments, Subscriptions, Customers and Refunds. Requests are
//! form-encoded; responses are normalized in `types`.

use crate::config::StripeConfig;
use crate::types::{
    StripeCustomer, StripeErrorResponse, StripePaymentIntent, StripeRefund, StripeSubscription,
};
use crate::webhook::{self, SIGNATURE_HEADER, STRIPE_EVENTS};
use async_trait::async_trait;
use chrono::Utc;
use pay_core::money::to_minor_units;
use pay_core::{
    CaptureResult, CreateCustomerRequest, CreatePaymentRequest, CreateSubscriptionRequest,
    Customer, EventTableEntry, PaymentError, PaymentProvider, PaymentResult, PaymentSnapshot,
    ProviderName, RefundRequest, RefundResult, ResourceKind, ResourceSnapshot,
    SubscriptionSnapshot, WebhookEvent, WebhookHeaders,
};
use reqwest::{Client, Method};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

const STRIPE: ProviderName = ProviderName::Stripe;

type FormParams = Vec<(String, String)>;

/// Stripe payment provider
pub struct StripeProvider {
    config: StripeConfig,
    client: Client,
}

impl StripeProvider {
    /// Create a new Stripe provider
    pub fn new(config: StripeConfig) -> PaymentResult<Self> {
        let client = Client::builder().build().map_err(|e| {
            PaymentError::Configuration(format!("Failed to create HTTP client: {e}"))
        })?;

        Ok(Self { config, client })
    }

    /// Create from environment variables
    pub fn from_env() -> PaymentResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Send a request and decode the JSON response.
    ///
    /// Timeouts become `Transport { timeout: true }`; non-2xx responses are
    /// decoded as Stripe error objects when possible.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &FormParams,
        idempotency_key: Option<&str>,
        timeout: Duration,
    ) -> PaymentResult<T> {
        let url = format!("{}{}", self.config.api_base_url, path);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", self.config.auth_header()?)
            .header("Stripe-Version", &self.config.api_version)
            .timeout(timeout);

        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        request = if method == Method::GET {
            request.query(params)
        } else {
            request.form(params)
        };

        let response = request.send().await.map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            error!("Stripe API error: status={}, path={}", status, path);

            let (code, message) = match serde_json::from_str::<StripeErrorResponse>(&body) {
                Ok(parsed) => (
                    parsed.error.code.or(parsed.error.error_type),
                    parsed
                        .error
                        .message
                        .unwrap_or_else(|| format!("HTTP {status}")),
                ),
                Err(_) => (None, format!("HTTP {}: {}", status, body)),
            };

            return Err(PaymentError::Provider {
                provider: STRIPE,
                code,
                message,
                status: Some(status.as_u16()),
            });
        }

        serde_json::from_str(&body).map_err(|e| {
            PaymentError::Serialization(format!("Failed to parse Stripe response: {}", e))
        })
    }
}

fn transport_error(e: reqwest::Error) -> PaymentError {
    PaymentError::transport(STRIPE, e.to_string(), e.is_timeout())
}

fn push_metadata(params: &mut FormParams, metadata: &HashMap<String, String>) {
    let mut keys: Vec<_> = metadata.keys().collect();
    keys.sort();
    for key in keys {
        params.push((format!("metadata[{}]", key), metadata[key].clone()));
    }
}

fn payment_params(request: &CreatePaymentRequest) -> PaymentResult<FormParams> {
    let mut params: FormParams = vec![
        (
            "amount".to_string(),
            to_minor_units(request.amount, &request.currency)?.to_string(),
        ),
        ("currency".to_string(), request.currency.lowercase()),
        (
            "capture_method".to_string(),
            if request.capture { "automatic" } else { "manual" }.to_string(),
        ),
        ("expand[]".to_string(), "latest_charge".to_string()),
    ];

    if let Some(ref customer) = request.customer {
        params.push(("customer".to_string(), customer.clone()));
    }
    if let Some(ref description) = request.description {
        params.push(("description".to_string(), description.clone()));
    }
    push_metadata(&mut params, &request.metadata);

    Ok(params)
}

fn subscription_params(
    request: &CreateSubscriptionRequest,
    expand: &[String],
) -> FormParams {
    let mut params: FormParams = vec![
        ("customer".to_string(), request.customer.clone()),
        ("items[0][price]".to_string(), request.plan_id.clone()),
        (
            "payment_behavior".to_string(),
            "default_incomplete".to_string(),
        ),
    ];

    if let Some(days) = request.trial_period_days {
        params.push(("trial_period_days".to_string(), days.to_string()));
    }
    if let Some(trial_end) = request.trial_end {
        params.push(("trial_end".to_string(), trial_end.timestamp().to_string()));
    }
    if let Some(anchor) = request.billing_cycle_anchor {
        params.push((
            "billing_cycle_anchor".to_string(),
            anchor.timestamp().to_string(),
        ));
    }
    for path in expand {
        params.push(("expand[]".to_string(), path.clone()));
    }
    push_metadata(&mut params, &request.metadata);

    params
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> ProviderName {
        STRIPE
    }

    fn is_configured(&self) -> bool {
        self.config.has_credentials()
    }

    #[instrument(skip(self, request), fields(amount = %request.amount, currency = %request.currency))]
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> PaymentResult<PaymentSnapshot> {
        let params = payment_params(request)?;

        let intent: StripePaymentIntent = self
            .call(
                Method::POST,
                "/v1/payment_intents",
                &params,
                request.idempotency_key.as_deref(),
                self.config.request_timeout,
            )
            .await?;

        info!("Created Stripe payment intent: id={}, status={}", intent.id, intent.status);
        intent.into_snapshot()
    }

    #[instrument(skip(self))]
    async fn capture_payment(&self, provider_payment_id: &str) -> PaymentResult<CaptureResult> {
        let intent: StripePaymentIntent = self
            .call(
                Method::POST,
                &format!("/v1/payment_intents/{}/capture", provider_payment_id),
                &Vec::new(),
                None,
                self.config.request_timeout,
            )
            .await?;

        info!("Captured Stripe payment intent: id={}", intent.id);
        intent.into_capture_result()
    }

    #[instrument(skip(self, request), fields(payment = %request.provider_payment_id))]
    async fn refund_payment(&self, request: &RefundRequest) -> PaymentResult<RefundResult> {
        let mut params: FormParams = vec![(
            "payment_intent".to_string(),
            request.provider_payment_id.clone(),
        )];
        if let Some(amount) = request.amount {
            params.push((
                "amount".to_string(),
                to_minor_units(amount, &request.currency)?.to_string(),
            ));
        }

        let refund: StripeRefund = self
            .call(
                Method::POST,
                "/v1/refunds",
                &params,
                request.idempotency_key.as_deref(),
                self.config.request_timeout,
            )
            .await?;

        info!("Created Stripe refund: id={}, amount={}", refund.id, refund.amount);
        refund.into_result()
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, provider_payment_id: &str) -> PaymentResult<PaymentSnapshot> {
        let params = vec![("expand[]".to_string(), "latest_charge".to_string())];
        let intent: StripePaymentIntent = self
            .call(
                Method::GET,
                &format!("/v1/payment_intents/{}", provider_payment_id),
                &params,
                None,
                self.config.request_timeout,
            )
            .await?;

        debug!("Fetched Stripe payment intent: id={}, status={}", intent.id, intent.status);
        intent.into_snapshot()
    }

    #[instrument(skip(self, request), fields(plan = %request.plan_id))]
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> PaymentResult<SubscriptionSnapshot> {
        let params = subscription_params(request, &self.config.subscription_expand);

        let subscription: StripeSubscription = self
            .call(
                Method::POST,
                "/v1/subscriptions",
                &params,
                request.idempotency_key.as_deref(),
                self.config.subscription_timeout,
            )
            .await?;

        info!(
            "Created Stripe subscription: id={}, status={}",
            subscription.id, subscription.status
        );
        subscription.into_snapshot()
    }

    #[instrument(skip(self))]
    async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> PaymentResult<SubscriptionSnapshot> {
        let subscription: StripeSubscription = self
            .call(
                Method::DELETE,
                &format!("/v1/subscriptions/{}", provider_subscription_id),
                &Vec::new(),
                None,
                self.config.request_timeout,
            )
            .await?;

        info!("Canceled Stripe subscription: id={}", subscription.id);
        subscription.into_snapshot()
    }

    #[instrument(skip(self, request))]
    async fn create_customer(&self, request: &CreateCustomerRequest) -> PaymentResult<Customer> {
        let mut params = FormParams::new();
        if let Some(ref email) = request.email {
            params.push(("email".to_string(), email.clone()));
        }
        if let Some(ref name) = request.name {
            params.push(("name".to_string(), name.clone()));
        }
        push_metadata(&mut params, &request.metadata);

        let customer: StripeCustomer = self
            .call(
                Method::POST,
                "/v1/customers",
                &params,
                None,
                self.config.request_timeout,
            )
            .await?;

        info!("Created Stripe customer: id={}", customer.id);
        Ok(customer.into())
    }

    #[instrument(skip(self, payload, headers))]
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &WebhookHeaders,
    ) -> PaymentResult<WebhookEvent> {
        let secret = self.config.webhook_secret.as_ref().ok_or_else(|| {
            PaymentError::Configuration("STRIPE_WEBHOOK_SECRET not set".to_string())
        })?;
        let signature = headers.require(SIGNATURE_HEADER)?;

        webhook::verify_signature(
            secret.expose_secret().as_bytes(),
            payload,
            signature,
            self.config.signature_tolerance_secs,
            Utc::now(),
        )?;

        webhook::parse_event(payload)
    }

    fn parse_resource(
        &self,
        kind: ResourceKind,
        resource: &serde_json::Value,
    ) -> PaymentResult<ResourceSnapshot> {
        webhook::parse_resource(kind, resource)
    }

    fn event_table(&self) -> &'static [EventTableEntry] {
        STRIPE_EVENTS
    }
}
