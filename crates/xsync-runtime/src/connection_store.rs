//! `ConnectionStore` over Postgres — the thin adapter `TokenManager` needs
//! so `xsync-token` stays free of `sqlx` (§4.2).

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use xsync_schemas::{Connection, EngineError, EngineResult, Provider};
use xsync_token::ConnectionStore;

pub struct DbConnectionStore {
    pool: PgPool,
}

impl DbConnectionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConnectionStore for DbConnectionStore {
    async fn load(&self, user_id: Uuid, provider: Provider) -> EngineResult<Connection> {
        xsync_db::fetch_connection(&self.pool, user_id, provider)
            .await
            .map_err(|e| EngineError::database(e.to_string()))?
            .ok_or_else(|| EngineError::oauth(format!("no {} connection on file for user {user_id}", provider.as_str())))
    }

    async fn save(&self, connection: &Connection) -> EngineResult<()> {
        xsync_db::upsert_connection(&self.pool, connection)
            .await
            .map_err(|e| EngineError::database(e.to_string()))
    }
}
