//! Account-member credential bundle.
//!
//! After sign-in the browser holds one management token per account the member
//! belongs to, plus which account is selected. The bundle travels as JSON in the
//! `ep_account_member_token` cookie:
//!
//! ```json
//! {
//!   "accounts": {
//!     "acc-1": {
//!       "account_id": "acc-1",
//!       "account_name": "Analytical Engines",
//!       "expires": 1798761600,
//!       "token": "...",
//!       "type": "account_management_authentication_token"
//!     }
//!   },
//!   "selected": "acc-1",
//!   "accountMemberId": "mem-1"
//! }
//! ```

use std::collections::BTreeMap;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use composable_core::{AccountId, AccountMemberId};

use crate::commerce::AccountCredential;

const TOKEN_TYPE: &str = "account_management_authentication_token";

/// One account's token as stored in the bundle.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountToken {
    pub account_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    /// Unix timestamp (seconds) after which the token is rejected.
    pub expires: i64,
    pub token: String,
    #[serde(rename = "type", default = "token_type")]
    pub token_type: String,
}

fn token_type() -> String {
    TOKEN_TYPE.to_string()
}

impl std::fmt::Debug for AccountToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountToken")
            .field("account_id", &self.account_id)
            .field("account_name", &self.account_name)
            .field("expires", &self.expires)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Credential bundle for a signed-in account member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountCredentials {
    pub accounts: BTreeMap<String, AccountToken>,
    pub selected: String,
    #[serde(rename = "accountMemberId")]
    pub account_member_id: AccountMemberId,
}

impl AccountCredentials {
    /// A bundle holding a single, selected account.
    #[cfg(any(test, feature = "test-support"))]
    #[must_use]
    pub fn single(member_id: AccountMemberId, credential: &AccountCredential) -> Self {
        use secrecy::ExposeSecret;

        let token = AccountToken {
            account_id: credential.account_id.clone(),
            account_name: credential.account_name.clone(),
            expires: credential.expires_at,
            token: credential.token.expose_secret().to_string(),
            token_type: token_type(),
        };
        Self {
            accounts: BTreeMap::from([(credential.account_id.to_string(), token)]),
            selected: credential.account_id.to_string(),
            account_member_id: member_id,
        }
    }

    fn selected_token(&self) -> Option<&AccountToken> {
        self.accounts.get(&self.selected)
    }

    /// Credential of the selected account, unless it has expired at `now`.
    #[must_use]
    pub fn selected_credential(&self, now: i64) -> Option<AccountCredential> {
        let token = self.selected_token()?;
        let credential = AccountCredential {
            account_id: token.account_id.clone(),
            account_name: token.account_name.clone(),
            member_id: self.account_member_id.clone(),
            token: SecretString::from(token.token.clone()),
            expires_at: token.expires,
        };
        (!credential.is_expired(now)).then_some(credential)
    }
}
