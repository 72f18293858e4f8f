//! Stripe REST client.
//!
//! Stripe takes form-encoded bodies and authenticates with the secret key as a
//! bearer token. Payment intents are addressed by the ID embedded in their client
//! secret (`pi_123_secret_456` -> `pi_123`).

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

use composable_core::{Address, CustomerId, Email, PaymentMethodId};

use super::{PaymentProcessor, ProcessorError, ProcessorOutcome};
use crate::config::PaymentsConfig;

/// Stripe REST client.
#[derive(Clone)]
pub struct StripeClient {
    inner: Arc<StripeClientInner>,
}

struct StripeClientInner {
    client: reqwest::Client,
    base_url: String,
    secret_key: SecretString,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: StripeErrorBody,
}

#[derive(Deserialize)]
struct StripeErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Deserialize)]
struct PaymentMethodResponse {
    id: PaymentMethodId,
}

#[derive(Deserialize)]
struct PaymentIntent {
    id: String,
    status: String,
    #[serde(default)]
    next_action: Option<NextAction>,
    #[serde(default)]
    last_payment_error: Option<StripeErrorBody>,
}

#[derive(Deserialize)]
struct NextAction {
    #[serde(default)]
    redirect_to_url: Option<RedirectToUrl>,
}

#[derive(Deserialize)]
struct RedirectToUrl {
    url: String,
}

impl PaymentIntent {
    fn outcome(self) -> ProcessorOutcome {
        match self.status.as_str() {
            "succeeded" | "requires_capture" => ProcessorOutcome::Succeeded,
            "processing" => ProcessorOutcome::Processing,
            "requires_action" => ProcessorOutcome::RequiresAction {
                redirect_url: self
                    .next_action
                    .and_then(|a| a.redirect_to_url)
                    .map(|r| r.url),
            },
            _ => ProcessorOutcome::Failed {
                message: self
                    .last_payment_error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| format!("Payment {} ({})", self.id, self.status)),
            },
        }
    }
}

/// Extract the payment intent ID from a client secret.
fn intent_id(client_secret: &str) -> Result<&str, ProcessorError> {
    client_secret
        .split_once("_secret_")
        .map(|(id, _)| id)
        .filter(|id| id.starts_with("pi_"))
        .ok_or(ProcessorError::InvalidClientSecret)
}

impl StripeClient {
    /// Create a new Stripe client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(config: &PaymentsConfig) -> Result<Self, ProcessorError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            inner: Arc::new(StripeClientInner {
                client,
                base_url: config.api_base_url.trim_end_matches('/').to_string(),
                secret_key: config.secret_key.clone(),
            }),
        })
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, ProcessorError> {
        let url = format!("{}{path}", self.inner.base_url);
        let response = self
            .inner
            .client
            .post(&url)
            .bearer_auth(self.inner.secret_key.expose_secret())
            .form(form)
            .send()
            .await?;
        self.handle_response(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ProcessorError> {
        let url = format!("{}{path}", self.inner.base_url);
        let response = self
            .inner
            .client
            .get(&url)
            .bearer_auth(self.inner.secret_key.expose_secret())
            .send()
            .await?;
        self.handle_response(response).await
    }

    /// Handle API response and parse JSON.
    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProcessorError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| ProcessorError::Parse(format!("Failed to parse response: {e}")));
        }

        Err(self.parse_error(response).await)
    }

    /// Parse error response from Stripe.
    async fn parse_error(&self, response: reqwest::Response) -> ProcessorError {
        let status = response.status().as_u16();

        if status == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            return ProcessorError::RateLimited(retry_after);
        }

        if status == 401 {
            return ProcessorError::Unauthorized;
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let message = serde_json::from_str::<ErrorEnvelope>(&body).map_or(body, |envelope| {
            tracing::warn!(status, code = ?envelope.error.code, "Payment processor rejected request");
            envelope
                .error
                .message
                .unwrap_or_else(|| "Payment processor error".to_string())
        });

        ProcessorError::Api { status, message }
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeClient")
            .field("base_url", &self.inner.base_url)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    #[instrument(skip(self, card_token, billing, email))]
    async fn create_payment_method(
        &self,
        card_token: &str,
        billing: &Address,
        email: &Email,
    ) -> Result<PaymentMethodId, ProcessorError> {
        let name = billing.full_name();
        let mut form = vec![
            ("type", "card"),
            ("card[token]", card_token),
            ("billing_details[name]", name.as_str()),
            ("billing_details[email]", email.as_str()),
            ("billing_details[address][line1]", billing.line_1.as_str()),
            ("billing_details[address][city]", billing.city.as_str()),
            ("billing_details[address][postal_code]", billing.postcode.as_str()),
            ("billing_details[address][country]", billing.country.as_str()),
        ];
        if let Some(line_2) = billing.line_2.as_deref() {
            form.push(("billing_details[address][line2]", line_2));
        }
        if let Some(region) = billing.region.as_deref().or(billing.county.as_deref()) {
            form.push(("billing_details[address][state]", region));
        }
        if let Some(phone) = billing.phone_number.as_deref() {
            form.push(("billing_details[phone]", phone));
        }

        let method: PaymentMethodResponse = self.post_form("/v1/payment_methods", &form).await?;
        Ok(method.id)
    }

    #[instrument(skip(self), fields(payment_method = %payment_method, customer = %customer))]
    async fn attach_payment_method(
        &self,
        payment_method: &PaymentMethodId,
        customer: &CustomerId,
    ) -> Result<(), ProcessorError> {
        let path = format!(
            "/v1/payment_methods/{}/attach",
            urlencoding::encode(payment_method.as_str())
        );
        let _: PaymentMethodResponse = self
            .post_form(&path, &[("customer", customer.as_str())])
            .await?;
        Ok(())
    }

    #[instrument(skip(self, client_secret))]
    async fn confirm_payment(
        &self,
        client_secret: &str,
        payment_method: Option<&PaymentMethodId>,
        return_url: &str,
    ) -> Result<ProcessorOutcome, ProcessorError> {
        let id = intent_id(client_secret)?;
        let path = format!("/v1/payment_intents/{}/confirm", urlencoding::encode(id));
        let mut form = vec![("return_url", return_url)];
        if let Some(payment_method) = payment_method {
            form.push(("payment_method", payment_method.as_str()));
        }
        let intent: PaymentIntent = self.post_form(&path, &form).await?;
        tracing::info!(payment_intent = %intent.id, status = %intent.status, "Payment intent confirmed");
        Ok(intent.outcome())
    }

    #[instrument(skip(self, client_secret))]
    async fn payment_status(&self, client_secret: &str) -> Result<ProcessorOutcome, ProcessorError> {
        let id = intent_id(client_secret)?;
        let path = format!("/v1/payment_intents/{}", urlencoding::encode(id));
        let intent: PaymentIntent = self.get(&path).await?;
        Ok(intent.outcome())
    }
}
