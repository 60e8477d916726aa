use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Sor,
    Grid,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Sor => "sor",
            Provider::Grid => "grid",
        }
    }
}

/// A per-user OAuth connection to either external API. Access/refresh
/// tokens are stored only in their encrypted `ivHex:authTagHex:cipherHex`
/// form (see `xsync-crypto`) — this struct never holds plaintext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: Provider,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: String,
    pub token_expiry: DateTime<Utc>,
    pub needs_reauth: bool,
    pub last_refresh_error: Option<String>,
    pub last_refresh_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    Connected,
    NeedsReauth,
    NotConnected,
}
