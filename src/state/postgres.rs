//! PostgreSQL-backed state store

use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::EventKey;
use crate::resolver::order::{ChainId, CrossChainOrder};
use crate::state::StateStore;

use async_trait::async_trait;
use ethers::types::H256;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(RelayerError::Database)?;

        Ok(Self { pool })
    }

    /// Create tables if missing
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_cursors (
                chain_id BIGINT PRIMARY KEY,
                block_number BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                chain_id BIGINT NOT NULL,
                tx_hash VARCHAR(66) NOT NULL,
                log_index BIGINT NOT NULL,
                block_number BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (chain_id, tx_hash, log_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_processed_chain_block
            ON processed_events (chain_id, block_number)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_audit (
                id BIGSERIAL PRIMARY KEY,
                order_hash VARCHAR(66) NOT NULL,
                state VARCHAR(20) NOT NULL,
                order_data JSONB NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn get_cursor(&self, chain_id: ChainId) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT block_number FROM chain_cursors WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn save_cursor(&self, chain_id: ChainId, height: u64) -> RelayerResult<()> {
        // GREATEST keeps the cursor monotone even under a stale write
        sqlx::query(
            r#"
            INSERT INTO chain_cursors (chain_id, block_number, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET block_number = GREATEST(chain_cursors.block_number, $2),
                          updated_at = NOW()
            "#,
        )
        .bind(chain_id as i64)
        .bind(height as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved cursor for chain {}: block {}", chain_id, height);
        Ok(())
    }

    async fn insert_processed(&self, key: &EventKey, block_number: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (chain_id, tx_hash, log_index, block_number)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(key.chain_id as i64)
        .bind(format!("{:?}", key.tx_hash))
        .bind(key.log_index as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_processed(&self, chain_id: ChainId) -> RelayerResult<Vec<EventKey>> {
        let rows = sqlx::query(
            "SELECT tx_hash, log_index FROM processed_events WHERE chain_id = $1",
        )
        .bind(chain_id as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let tx_hash: String = row.get("tx_hash");
            let tx_hash = tx_hash
                .parse::<H256>()
                .map_err(|e| RelayerError::Internal(format!("bad tx hash in store: {}", e)))?;
            keys.push(EventKey {
                chain_id,
                tx_hash,
                log_index: row.get::<i64, _>("log_index") as u64,
            });
        }
        Ok(keys)
    }

    async fn prune_processed(&self, chain_id: ChainId, below: u64) -> RelayerResult<()> {
        sqlx::query(
            "DELETE FROM processed_events WHERE chain_id = $1 AND block_number < $2",
        )
        .bind(chain_id as i64)
        .bind(below as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_terminal_order(&self, order: &CrossChainOrder) -> RelayerResult<()> {
        let order_data = serde_json::to_value(order)
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO order_audit (order_hash, state, order_data)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(format!("0x{}", hex::encode(order.order_hash)))
        .bind(order.state.as_str())
        .bind(order_data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(RelayerError::Database)?;
        Ok(())
    }
}
