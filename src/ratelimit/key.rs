//! Store key namespaces.

use std::fmt;

const PREFIX: &str = "ratelimit";

/// A key identifying one record in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// Window, pause and daily counters for an account/action pair
    State { account: String, action: String },
    /// Consecutive-error counter for an account
    Errors { account: String },
}

impl StoreKey {
    pub fn state(account: &str, action: &str) -> Self {
        StoreKey::State {
            account: account.to_string(),
            action: action.to_string(),
        }
    }

    pub fn errors(account: &str) -> Self {
        StoreKey::Errors {
            account: account.to_string(),
        }
    }

    /// Convert to the string used by the store.
    /// Format: "ratelimit|state|{account byte length}:{account}|{action}" or
    /// "ratelimit|errors|{account}"
    ///
    /// The length prefix keeps pairs distinct when either part contains `|`.
    pub fn to_store_key(&self) -> String {
        match self {
            StoreKey::State { account, action } => {
                format!("{}|state|{}:{}|{}", PREFIX, account.len(), account, action)
            }
            StoreKey::Errors { account } => format!("{}|errors|{}", PREFIX, account),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
