//! Typed cookie access.
//!
//! Handlers never touch raw `Cookie` headers. They read and write through
//! [`CookieRepository`], whose provided methods know each cookie's name,
//! encoding and attributes. [`SessionCookies`] is the request-scoped
//! implementation; returning it from a handler emits the pending `Set-Cookie`
//! headers.

use std::collections::HashMap;

use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponseParts, ResponseParts};
use tower_sessions::cookie::time::Duration;
use tower_sessions::cookie::{Cookie, SameSite};
use tracing::warn;

use composable_core::CartId;

use super::credentials::AccountCredentials;

/// Cookie names.
pub mod names {
    pub const CART: &str = "ep_cart";
    pub const ACCOUNT_MEMBER_TOKEN: &str = "ep_account_member_token";
    pub const SHIPPING_GROUPS: &str = "shipping_groups";
}

/// Cart cookie lifetime (30 days).
const CART_MAX_AGE_DAYS: i64 = 30;

/// Read/write access to the storefront cookies.
pub trait CookieRepository {
    /// Raw (still URL-encoded) value of a cookie sent with the request or
    /// written since.
    fn read(&self, name: &str) -> Option<&str>;

    /// Queue a cookie to be set on the response.
    fn write(&mut self, cookie: Cookie<'static>);

    /// Whether cookies are marked `Secure`.
    fn secure(&self) -> bool;

    fn cart_id(&self) -> Option<CartId> {
        self.read(names::CART)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(CartId::new)
    }

    /// Point the cart cookie at a (new) cart, replacing the old value.
    fn set_cart_id(&mut self, cart_id: &CartId) {
        let cookie = Cookie::build((names::CART, cart_id.to_string()))
            .path("/")
            .same_site(SameSite::Strict)
            .secure(self.secure())
            .http_only(true)
            .max_age(Duration::days(CART_MAX_AGE_DAYS))
            .build();
        self.write(cookie);
    }

    /// The credential bundle, when present and well formed.
    fn credentials(&self) -> Option<AccountCredentials> {
        let raw = self.read(names::ACCOUNT_MEMBER_TOKEN)?;
        let json = urlencoding::decode(raw).ok()?;
        match serde_json::from_str(&json) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                warn!("Ignoring malformed credential cookie: {e}");
                None
            }
        }
    }

    /// Shipping-group mode is on only when the toggle cookie says so.
    fn shipping_groups_enabled(&self) -> bool {
        self.read(names::SHIPPING_GROUPS)
            .is_some_and(|v| matches!(v, "true" | "1" | "on" | "enabled"))
    }
}

/// Cookies of one request plus the writes queued while handling it.
#[derive(Debug, Clone, Default)]
pub struct SessionCookies {
    values: HashMap<String, String>,
    pending: Vec<Cookie<'static>>,
    secure: bool,
}

impl SessionCookies {
    /// Parse every `Cookie` header of a request. Unparseable pairs are skipped.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap, secure: bool) -> Self {
        let values = headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();

        Self {
            values,
            pending: Vec::new(),
            secure,
        }
    }

    /// `Set-Cookie` values queued so far.
    #[cfg(test)]
    #[must_use]
    pub fn pending(&self) -> &[Cookie<'static>] {
        &self.pending
    }
}

impl CookieRepository for SessionCookies {
    fn read(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn write(&mut self, cookie: Cookie<'static>) {
        self.values
            .insert(cookie.name().to_string(), cookie.value().to_string());
        self.pending.retain(|pending| pending.name() != cookie.name());
        self.pending.push(cookie);
    }

    fn secure(&self) -> bool {
        self.secure
    }
}

impl IntoResponseParts for SessionCookies {
    type Error = std::convert::Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        for cookie in self.pending {
            match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => {
                    res.headers_mut().append(SET_COOKIE, value);
                }
                Err(e) => warn!(cookie = cookie.name(), "Skipping unencodable cookie: {e}"),
            }
        }
        Ok(res)
    }
}
