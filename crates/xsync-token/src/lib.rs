//! `TokenManager` — keeps a per-`(user, provider)` access token valid (§4.2).
//!
//! The HTTP details of each provider's OAuth refresh endpoint live outside
//! this crate behind [`TokenRefresher`]; persistence lives behind
//! [`ConnectionStore`] so this crate stays free of both `reqwest` and `sqlx`,
//! the same seam `xsync-sor-client`/`xsync-grid-client` use for their own
//! backends.
//!
//! Refreshes for the same key are serialized through a per-key
//! `tokio::sync::Mutex`, mirroring `xsync-ratelimit::RateLimiter`'s
//! mutex-guarded bucket: a second caller for the same `(user, provider)`
//! blocks behind the first's refresh instead of racing it, and observes the
//! already-refreshed connection once it acquires the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use xsync_crypto::EncryptionService;
use xsync_schemas::{Connection, EngineError, EngineResult, Provider};

/// Tokens returned by a successful provider refresh call.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    /// Some providers rotate the refresh token on every use; `None` means
    /// keep the one already on file.
    pub refresh_token: Option<String>,
    pub expires_in: StdDuration,
}

/// Abstracts the provider-specific OAuth refresh call (§6: SOR/Grid each
/// have their own client id/secret/redirect URI).
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, provider: Provider, refresh_token: &str) -> EngineResult<RefreshedTokens>;
}

/// Abstracts loading/persisting the encrypted `Connection` row. The `xsync-db`
/// crate provides the production implementation; tests use an in-memory one.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    async fn load(&self, user_id: Uuid, provider: Provider) -> EngineResult<Connection>;
    async fn save(&self, connection: &Connection) -> EngineResult<()>;
}

const REFRESH_ATTEMPTS: u32 = 3;
const PROACTIVE_WINDOW: Duration = Duration::minutes(5);

/// §4.2's terminal-error signal set. Matched case-insensitively against the
/// provider's error response; any match marks the connection `needs_reauth`
/// and stops all future refresh attempts until the user reconnects.
const TERMINAL_SIGNALS: &[&str] = &["invalid_grant", "revoked", "expired", "unauthorized", "invalid_client"];

fn is_terminal(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TERMINAL_SIGNALS.iter().any(|signal| lower.contains(signal))
}

pub struct TokenManager {
    store: Arc<dyn ConnectionStore>,
    refresher: Arc<dyn TokenRefresher>,
    crypto: Arc<EncryptionService>,
    locks: Mutex<HashMap<(Uuid, Provider), Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn ConnectionStore>, refresher: Arc<dyn TokenRefresher>, crypto: Arc<EncryptionService>) -> Self {
        Self {
            store,
            refresher,
            crypto,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, user_id: Uuid, provider: Provider) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry((user_id, provider)).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// §4.2's full `GetValidToken` contract.
    pub async fn get_valid_token(&self, user_id: Uuid, provider: Provider) -> EngineResult<String> {
        let key_lock = self.lock_for(user_id, provider).await;
        let _serialize = key_lock.lock().await;

        let mut connection = self.store.load(user_id, provider).await?;

        if connection.needs_reauth {
            return Err(EngineError::oauth(format!(
                "{} connection requires reauthentication",
                provider.as_str()
            ))
            .with_provider(provider.as_str()));
        }

        let now = Utc::now();
        if now + PROACTIVE_WINDOW < connection.token_expiry {
            return self.crypto.decrypt(&connection.encrypted_access_token);
        }

        let refresh_token = self.crypto.decrypt(&connection.encrypted_refresh_token)?;
        let mut last_error: Option<EngineError> = None;

        for attempt in 1..=REFRESH_ATTEMPTS {
            match self.refresher.refresh(provider, &refresh_token).await {
                Ok(tokens) => return self.apply_refresh(&mut connection, tokens, now).await,
                Err(e) if is_terminal(&e.message) => {
                    return self.mark_needs_reauth(&mut connection, provider, &e.message, now).await;
                }
                Err(e) => {
                    tracing::warn!(provider = provider.as_str(), attempt, error = %e, "token refresh attempt failed");
                    last_error = Some(e);
                    if attempt < REFRESH_ATTEMPTS {
                        tokio::time::sleep(StdDuration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| EngineError::network("token refresh failed with no response"));
        connection.last_refresh_error = Some(error.message.clone());
        connection.last_refresh_attempt = Some(now);
        self.store.save(&connection).await?;
        Err(error)
    }

    async fn apply_refresh(&self, connection: &mut Connection, tokens: RefreshedTokens, now: DateTime<Utc>) -> EngineResult<String> {
        connection.encrypted_access_token = self.crypto.encrypt(&tokens.access_token)?;
        if let Some(refresh_token) = &tokens.refresh_token {
            connection.encrypted_refresh_token = self.crypto.encrypt(refresh_token)?;
        }
        connection.token_expiry = now + Duration::from_std(tokens.expires_in).unwrap_or(Duration::hours(1));
        connection.needs_reauth = false;
        connection.last_refresh_error = None;
        connection.last_refresh_attempt = Some(now);
        self.store.save(connection).await?;
        Ok(tokens.access_token)
    }

    async fn mark_needs_reauth(&self, connection: &mut Connection, provider: Provider, message: &str, now: DateTime<Utc>) -> EngineResult<String> {
        connection.needs_reauth = true;
        connection.last_refresh_error = Some(message.to_string());
        connection.last_refresh_attempt = Some(now);
        self.store.save(connection).await?;
        Err(EngineError::oauth(format!("{} reauthentication required: {message}", provider.as_str())).with_provider(provider.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    fn crypto() -> Arc<EncryptionService> {
        Arc::new(EncryptionService::new(&hex::encode([3u8; 32])).unwrap())
    }

    struct InMemoryStore {
        crypto: Arc<EncryptionService>,
        conn: TokioMutex<Connection>,
    }

    impl InMemoryStore {
        fn new(crypto: Arc<EncryptionService>, expiry: DateTime<Utc>, needs_reauth: bool) -> Arc<Self> {
            let conn = Connection {
                id: Uuid::new_v4(),
                user_id: Uuid::new_v4(),
                provider: Provider::Sor,
                encrypted_access_token: crypto.encrypt("old-access").unwrap(),
                encrypted_refresh_token: crypto.encrypt("refresh-1").unwrap(),
                token_expiry: expiry,
                needs_reauth,
                last_refresh_error: None,
                last_refresh_attempt: None,
            };
            Arc::new(Self { crypto, conn: TokioMutex::new(conn) })
        }
    }

    #[async_trait]
    impl ConnectionStore for InMemoryStore {
        async fn load(&self, _user_id: Uuid, _provider: Provider) -> EngineResult<Connection> {
            Ok(self.conn.lock().await.clone())
        }
        async fn save(&self, connection: &Connection) -> EngineResult<()> {
            *self.conn.lock().await = connection.clone();
            Ok(())
        }
    }

    struct CountingRefresher {
        calls: AtomicU32,
        terminal: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _provider: Provider, _refresh_token: &str) -> EngineResult<RefreshedTokens> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.terminal {
                Err(EngineError::oauth("invalid_grant: refresh token revoked"))
            } else {
                Ok(RefreshedTokens {
                    access_token: "new-access".into(),
                    refresh_token: Some("new-refresh".into()),
                    expires_in: StdDuration::from_secs(3600),
                })
            }
        }
    }

    #[tokio::test]
    async fn returns_cached_token_when_still_fresh() {
        let crypto = crypto();
        let store = InMemoryStore::new(crypto.clone(), Utc::now() + Duration::hours(2), false);
        let refresher = Arc::new(CountingRefresher { calls: AtomicU32::new(0), terminal: false });
        let manager = TokenManager::new(store.clone(), refresher.clone(), crypto);

        let token = manager.get_valid_token(Uuid::new_v4(), Provider::Sor).await.unwrap();
        assert_eq!(token, "old-access");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn refreshes_when_within_proactive_window() {
        let crypto = crypto();
        let store = InMemoryStore::new(crypto.clone(), Utc::now() + Duration::minutes(1), false);
        let refresher = Arc::new(CountingRefresher { calls: AtomicU32::new(0), terminal: false });
        let manager = TokenManager::new(store.clone(), refresher.clone(), crypto);

        let token = manager.get_valid_token(Uuid::new_v4(), Provider::Sor).await.unwrap();
        assert_eq!(token, "new-access");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let saved = store.conn.lock().await.clone();
        assert!(!saved.needs_reauth);
        assert!(saved.token_expiry > Utc::now() + Duration::minutes(30));
    }

    #[tokio::test]
    async fn needs_reauth_short_circuits_before_any_refresh_call() {
        let crypto = crypto();
        let store = InMemoryStore::new(crypto.clone(), Utc::now() - Duration::hours(1), true);
        let refresher = Arc::new(CountingRefresher { calls: AtomicU32::new(0), terminal: false });
        let manager = TokenManager::new(store, refresher.clone(), crypto);

        let err = manager.get_valid_token(Uuid::new_v4(), Provider::Sor).await.unwrap_err();
        assert_eq!(err.kind, xsync_schemas::ErrorKind::OAuth);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn terminal_refresh_error_marks_needs_reauth() {
        let crypto = crypto();
        let store = InMemoryStore::new(crypto.clone(), Utc::now() - Duration::hours(1), false);
        let refresher = Arc::new(CountingRefresher { calls: AtomicU32::new(0), terminal: true });
        let manager = TokenManager::new(store.clone(), refresher.clone(), crypto);

        let err = manager.get_valid_token(Uuid::new_v4(), Provider::Sor).await.unwrap_err();
        assert_eq!(err.kind, xsync_schemas::ErrorKind::OAuth);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let saved = store.conn.lock().await.clone();
        assert!(saved.needs_reauth);
        assert!(saved.last_refresh_error.is_some());
    }

    #[test]
    fn terminal_signals_are_case_insensitive() {
        assert!(is_terminal("INVALID_GRANT"));
        assert!(is_terminal("token Revoked by user"));
        assert!(!is_terminal("temporary network blip"));
    }
}
