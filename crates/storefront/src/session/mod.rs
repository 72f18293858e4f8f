//! Per-request shopper session.
//!
//! The shopper's cart, account credentials and preferences travel in cookies
//! (see [`cookies`]). [`SessionContext`] parses them once per request and hands
//! handlers typed values plus a [`SessionCookies`] to write changes back.

pub mod cookies;
pub mod credentials;

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use composable_core::CartId;

use crate::checkout::CheckoutContext;
use crate::commerce::AccountCredential;
use crate::state::AppState;

pub use cookies::{CookieRepository, SessionCookies};
pub use credentials::{AccountCredentials, AccountToken};

/// Cookie-backed view of the current shopper.
#[derive(Debug, Clone)]
pub struct SessionContext {
    cookies: SessionCookies,
    credential: Option<AccountCredential>,
}

impl SessionContext {
    /// Build the context from request cookies, resolving the selected
    /// credential as of `now` (unix seconds). Expired tokens are ignored.
    #[must_use]
    pub fn new(cookies: SessionCookies, now: i64) -> Self {
        let credential = cookies
            .credentials()
            .and_then(|credentials| credentials.selected_credential(now));
        Self {
            cookies,
            credential,
        }
    }

    #[must_use]
    pub fn cart_id(&self) -> Option<CartId> {
        self.cookies.cart_id()
    }

    /// The selected, unexpired account credential.
    #[must_use]
    pub const fn credential(&self) -> Option<&AccountCredential> {
        self.credential.as_ref()
    }

    #[must_use]
    pub fn shipping_groups_enabled(&self) -> bool {
        self.cookies.shipping_groups_enabled()
    }

    /// Checkout inputs for the shopper's cart, if they have one.
    #[must_use]
    pub fn checkout_context(&self) -> Option<CheckoutContext> {
        Some(CheckoutContext {
            cart_id: self.cart_id()?,
            credential: self.credential.clone(),
            shipping_groups_enabled: self.shipping_groups_enabled(),
        })
    }

    /// Cookie writer; return it from the handler to emit queued cookies.
    pub const fn cookies_mut(&mut self) -> &mut SessionCookies {
        &mut self.cookies
    }

    #[must_use]
    pub fn into_cookies(self) -> SessionCookies {
        self.cookies
    }
}

impl FromRequestParts<AppState> for SessionContext {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = SessionCookies::from_headers(&parts.headers, state.config().is_secure());
        Ok(Self::new(cookies, chrono::Utc::now().timestamp()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::header::COOKIE;
    use axum::http::{HeaderMap, HeaderValue};
    use secrecy::SecretString;

    use composable_core::{AccountId, AccountMemberId};

    use super::*;

    fn credential(expires_at: i64) -> AccountCredential {
        AccountCredential {
            account_id: AccountId::new("acc-1"),
            account_name: Some("Ada".into()),
            member_id: AccountMemberId::new("mem-1"),
            token: SecretString::from("tok"),
            expires_at,
        }
    }

    fn headers(credentials: &AccountCredentials) -> HeaderMap {
        let json = serde_json::to_string(credentials).unwrap();
        let value = format!(
            "ep_cart=cart-1; ep_account_member_token={}; shipping_groups=on",
            urlencoding::encode(&json)
        );
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn test_checkout_context_from_cookies() {
        let credentials = AccountCredentials::single(AccountMemberId::new("mem-1"), &credential(2_000));
        let cookies = SessionCookies::from_headers(&headers(&credentials), false);
        let context = SessionContext::new(cookies, 1_000);

        let checkout = context.checkout_context().unwrap();
        assert_eq!(checkout.cart_id.as_str(), "cart-1");
        assert!(checkout.shipping_groups_enabled);
        assert_eq!(
            checkout.credential.unwrap().account_id.as_str(),
            "acc-1"
        );
    }

    #[test]
    fn test_expired_credential_is_ignored() {
        let credentials = AccountCredentials::single(AccountMemberId::new("mem-1"), &credential(500));
        let cookies = SessionCookies::from_headers(&headers(&credentials), false);
        let context = SessionContext::new(cookies, 1_000);

        assert!(context.credential().is_none());
        assert!(context.checkout_context().unwrap().credential.is_none());
    }

    #[test]
    fn test_no_cart_means_no_checkout() {
        let context = SessionContext::new(SessionCookies::default(), 0);
        assert!(context.checkout_context().is_none());
        assert!(!context.shipping_groups_enabled());
    }
}
