use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Current credential for the downstream client-credentials grant
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
}

impl AccessToken {
    pub fn new(value: String, expires_in: i64, scope: String) -> Self {
        let issued_at = Utc::now();
        Self {
            value,
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(expires_in.max(0)),
            scope,
        }
    }

    /// Whether the token may still be sent at `now`, keeping `margin` before expiry
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(margin) {
            Some(deadline) => deadline < self.expires_at,
            None => false,
        }
    }

    pub fn is_usable(&self, margin: Duration) -> bool {
        self.is_usable_at(Utc::now(), margin)
    }

    /// Short prefix safe to put in logs
    pub fn preview(&self) -> String {
        format!("{}...", self.value.chars().take(8).collect::<String>())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &self.preview())
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}
