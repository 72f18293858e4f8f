//! Checkout form validation.
//!
//! The browser submits a [`CheckoutFormInput`]. It is validated once, at the
//! boundary, into a [`CheckoutForm`] whose identity is a proper sum type: a guest
//! identified by email, or an account member. Every problem is reported per
//! field rather than stopping at the first one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use composable_core::{Address, AddressError, Email, PaymentMethodId};

use crate::commerce::AccountCredential;

/// How the shopper pays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    /// Card payment through the platform's default gateway.
    #[default]
    EpPayment,
    /// Deferred payment (purchase order, invoice).
    Manual,
}

/// Identity sub-object as submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityInput {
    Guest {
        #[serde(default)]
        email: String,
    },
    Account {
        #[serde(default)]
        email: String,
        #[serde(default)]
        name: String,
    },
}

/// Checkout form as submitted by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutFormInput {
    pub identity: IdentityInput,
    #[serde(default)]
    pub shipping_address: Address,
    #[serde(default = "default_true")]
    pub same_as_shipping: bool,
    #[serde(default)]
    pub billing_address: Option<Address>,
    #[serde(default)]
    pub shipping_method: String,
    #[serde(default)]
    pub payment_method: PaymentMethodKind,
    #[serde(default)]
    pub purchase_order_number: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Previously saved processor payment method to charge.
    #[serde(default)]
    pub saved_card_id: Option<String>,
    /// Card token from the processor's client-side element.
    #[serde(default)]
    pub card_token: Option<String>,
    #[serde(default)]
    pub quote_id: Option<String>,
}

const fn default_true() -> bool {
    true
}

impl CheckoutFormInput {
    /// Default values for a new form. Signed-in shoppers get an account
    /// identity, everyone else a guest identity.
    #[must_use]
    pub fn defaults(credential: Option<&AccountCredential>, standard_shipping: &str) -> Self {
        let identity = match credential {
            Some(credential) => IdentityInput::Account {
                email: String::new(),
                name: credential.account_name.clone().unwrap_or_default(),
            },
            None => IdentityInput::Guest {
                email: String::new(),
            },
        };

        Self {
            identity,
            shipping_address: Address::default(),
            same_as_shipping: true,
            billing_address: None,
            shipping_method: standard_shipping.to_string(),
            payment_method: PaymentMethodKind::default(),
            purchase_order_number: None,
            notes: None,
            saved_card_id: None,
            card_token: None,
            quote_id: None,
        }
    }

    /// Validate the submission for a session that is (or is not) signed in.
    ///
    /// # Errors
    ///
    /// Returns a [`FormError`] carrying one message per invalid field.
    pub fn validate(self, authenticated: bool) -> Result<CheckoutForm, FormError> {
        let mut errors = FieldErrors::default();

        let identity = match self.identity {
            IdentityInput::Guest { .. } if authenticated => {
                errors.add("identity", "Signed-in shoppers check out with their account");
                None
            }
            IdentityInput::Account { .. } if !authenticated => {
                errors.add("identity", "Sign in to check out with an account");
                None
            }
            IdentityInput::Guest { email } => {
                parse_email(&email, &mut errors).map(|email| Identity::Guest { email })
            }
            IdentityInput::Account { email, name } => {
                let email = parse_email(&email, &mut errors);
                let name = name.trim().to_string();
                if name.is_empty() {
                    errors.add("identity.name", "Name is required");
                }
                email
                    .filter(|_| !name.is_empty())
                    .map(|email| Identity::Account { email, name })
            }
        };

        if let Err(e) = self.shipping_address.validate() {
            errors.address("shipping_address", &e);
        }

        let billing_address = if self.same_as_shipping {
            None
        } else {
            self.billing_address
        };
        if let Some(Err(e)) = billing_address.as_ref().map(Address::validate) {
            errors.address("billing_address", &e);
        }

        let shipping_method = self.shipping_method.trim().to_string();
        if shipping_method.is_empty() {
            errors.add("shipping_method", "Choose a shipping method");
        }

        match identity {
            Some(identity) if errors.is_empty() => Ok(CheckoutForm {
                identity,
                shipping_address: self.shipping_address,
                billing_address,
                shipping_method,
                payment_method: self.payment_method,
                purchase_order_number: non_blank(self.purchase_order_number),
                notes: non_blank(self.notes),
                saved_card_id: non_blank(self.saved_card_id).map(PaymentMethodId::new),
                card_token: non_blank(self.card_token),
                quote_id: non_blank(self.quote_id),
            }),
            _ => Err(errors.into_error()),
        }
    }
}

fn parse_email(raw: &str, errors: &mut FieldErrors) -> Option<Email> {
    Email::parse(raw)
        .map_err(|e| errors.add("identity.email", capitalize(&e.to_string())))
        .ok()
}

fn capitalize(message: &str) -> String {
    let mut chars = message.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Validated shopper identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Guest { email: Email },
    Account { email: Email, name: String },
}

impl Identity {
    #[must_use]
    pub const fn email(&self) -> &Email {
        match self {
            Self::Guest { email } | Self::Account { email, .. } => email,
        }
    }

    #[must_use]
    pub const fn is_account(&self) -> bool {
        matches!(self, Self::Account { .. })
    }
}

/// A checkout form that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutForm {
    pub identity: Identity,
    pub shipping_address: Address,
    /// Present only when the shopper asked for a billing address different from
    /// the shipping address.
    pub billing_address: Option<Address>,
    pub shipping_method: String,
    pub payment_method: PaymentMethodKind,
    pub purchase_order_number: Option<String>,
    pub notes: Option<String>,
    pub saved_card_id: Option<PaymentMethodId>,
    pub card_token: Option<String>,
    pub quote_id: Option<String>,
}

impl CheckoutForm {
    /// The billing address to charge: the explicit one when given, else shipping.
    #[must_use]
    pub fn effective_billing_address(&self) -> &Address {
        self.billing_address
            .as_ref()
            .unwrap_or(&self.shipping_address)
    }

    /// Name recorded on the order.
    #[must_use]
    pub fn contact_name(&self) -> String {
        match &self.identity {
            Identity::Account { name, .. } => name.clone(),
            Identity::Guest { .. } => self.shipping_address.full_name(),
        }
    }
}

#[derive(Debug, Default)]
struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_insert_with(|| message.into());
    }

    fn address(&mut self, prefix: &str, error: &AddressError) {
        for field in &error.missing {
            self.add(&format!("{prefix}.{field}"), "Required");
        }
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn into_error(self) -> FormError {
        FormError { fields: self.0 }
    }
}

/// The checkout form failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{}", self.summary())]
pub struct FormError {
    /// Message per invalid field, keyed by dotted field path.
    pub fields: BTreeMap<String, String>,
}

impl FormError {
    /// Single message for a toast.
    #[must_use]
    pub fn summary(&self) -> String {
        match self.fields.len() {
            0 => "Please check the checkout form".to_string(),
            1 => self
                .fields
                .values()
                .next()
                .filter(|m| m.as_str() != "Required")
                .cloned()
                .unwrap_or_else(|| "Please fill in the highlighted field".to_string()),
            n => format!("Please correct the {n} highlighted fields"),
        }
    }
}
