//! Postgres-backed order-book store.
//!
//! uint256 values live in `NUMERIC(78, 0)` columns. They are bound as decimal
//! text cast with `::numeric` and read back with `::text`, so no precision is
//! lost on the way through. Addresses and hashes are stored as raw bytes.

use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use super::{
    nonce_status, ApprovalStatus, CollectionStats, FillabilityStatus, OrderBookStore,
    OrderRecord,
};
use crate::error::StoreError;
use crate::events::log::ProtocolKind;
use crate::events::types::{
    BulkCancelEvent, CancelEvent, FillEvent, FungibleTransfer, NonceInvalidation, OrderSide,
    OrderUpdate, Swap,
};

const ORDER_COLUMNS: &str = "id, protocol, side, maker, contract, token_id::text AS token_id, \
     nonce::text AS nonce, master_nonce::text AS master_nonce, price::text AS price, \
     currency, fillability_status, approval_status, block_number, log_index";

/// Order-book store over a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgOrderBookStore {
    pool: PgPool,
}

impl PgOrderBookStore {
    /// Wraps an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be created.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("order book migrations applied");
        Ok(())
    }

    /// Returns the pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn set_status(
        &self,
        id: B256,
        status: FillabilityStatus,
        position: (u64, u64),
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET fillability_status = $2, block_number = $3, log_index = $4, updated_at = NOW()
            WHERE id = $1 AND (block_number, log_index) < ($3, $4)
            "#,
        )
        .bind(id.as_slice())
        .bind(status.as_str())
        .bind(to_i64(position.0))
        .bind(to_i64(position.1))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn nonce_invalidated(
        &self,
        protocol: ProtocolKind,
        maker: Address,
        nonce: U256,
    ) -> Result<Option<bool>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT was_cancellation FROM nonce_invalidations
            WHERE protocol = $1 AND maker = $2 AND nonce = $3::numeric
            "#,
        )
        .bind(protocol.as_str())
        .bind(maker.as_slice())
        .bind(nonce.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<bool, _>("was_cancellation"))
            .transpose()
            .map_err(StoreError::from)
    }
}

const fn to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

/// Orders column a bulk cancel of `protocol` compares against the new counter.
///
/// Mirrors [`OrderRecord::bulk_cancel_nonce`].
const fn bulk_cancel_column(protocol: ProtocolKind) -> &'static str {
    match protocol {
        ProtocolKind::PaymentProcessorV2 => "master_nonce",
        _ => "nonce",
    }
}

fn corrupt(column: &'static str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        column,
        reason: reason.to_string(),
    }
}

fn read_address(row: &PgRow, column: &'static str) -> Result<Address, StoreError> {
    let bytes: Vec<u8> = row.try_get(column)?;
    Address::try_from(bytes.as_slice()).map_err(|e| corrupt(column, e))
}

fn read_b256(row: &PgRow, column: &'static str) -> Result<B256, StoreError> {
    let bytes: Vec<u8> = row.try_get(column)?;
    B256::try_from(bytes.as_slice()).map_err(|e| corrupt(column, e))
}

fn parse_u256(column: &'static str, text: &str) -> Result<U256, StoreError> {
    U256::from_str_radix(text, 10).map_err(|e| corrupt(column, e))
}

fn read_u256(row: &PgRow, column: &'static str) -> Result<U256, StoreError> {
    let text: String = row.try_get(column)?;
    parse_u256(column, &text)
}

fn read_u64(row: &PgRow, column: &'static str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|e| corrupt(column, e))
}

fn order_from_row(row: &PgRow) -> Result<OrderRecord, StoreError> {
    let protocol: String = row.try_get("protocol")?;
    let side: String = row.try_get("side")?;
    let fillability: String = row.try_get("fillability_status")?;
    let approval: String = row.try_get("approval_status")?;
    let nonce: Option<String> = row.try_get("nonce")?;
    let master_nonce: Option<String> = row.try_get("master_nonce")?;

    Ok(OrderRecord {
        id: read_b256(row, "id")?,
        protocol: ProtocolKind::parse(&protocol).ok_or_else(|| corrupt("protocol", &protocol))?,
        side: OrderSide::parse(&side).ok_or_else(|| corrupt("side", &side))?,
        maker: read_address(row, "maker")?,
        contract: read_address(row, "contract")?,
        token_id: read_u256(row, "token_id")?,
        nonce: nonce.map(|n| parse_u256("nonce", &n)).transpose()?,
        master_nonce: master_nonce
            .map(|n| parse_u256("master_nonce", &n))
            .transpose()?,
        price: read_u256(row, "price")?,
        currency: read_address(row, "currency")?,
        fillability_status: FillabilityStatus::parse(&fillability)
            .ok_or_else(|| corrupt("fillability_status", &fillability))?,
        approval_status: ApprovalStatus::parse(&approval)
            .ok_or_else(|| corrupt("approval_status", &approval))?,
        block_number: read_u64(row, "block_number")?,
        log_index: read_u64(row, "log_index")?,
    })
}

fn token_key(token_id: Option<U256>) -> String {
    token_id.map(|id| id.to_string()).unwrap_or_default()
}

fn ids_from_rows(rows: &[PgRow]) -> Result<Vec<B256>, StoreError> {
    rows.iter().map(|row| read_b256(row, "id")).collect()
}

#[async_trait]
impl OrderBookStore for PgOrderBookStore {
    async fn insert_fills(&self, fills: &[FillEvent]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for fill in fills {
            let result = sqlx::query(
                r#"
                INSERT INTO fill_events (
                    tx_hash, log_index, batch_index, address, block_number, block_hash,
                    timestamp, protocol, order_id, order_side, maker, taker, contract,
                    token_id, amount, price, currency
                )
                VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14::numeric, $15::numeric, $16::numeric, $17
                )
                ON CONFLICT (tx_hash, log_index, batch_index) DO NOTHING
                "#,
            )
            .bind(fill.ctx.tx_hash.as_slice())
            .bind(to_i64(fill.ctx.log_index))
            .bind(to_i64(fill.ctx.batch_index))
            .bind(fill.ctx.address.as_slice())
            .bind(to_i64(fill.ctx.block_number))
            .bind(fill.ctx.block_hash.as_slice())
            .bind(to_i64(fill.ctx.timestamp))
            .bind(fill.protocol.as_str())
            .bind(fill.order_id.as_ref().map(|id| id.as_slice()))
            .bind(fill.side.as_str())
            .bind(fill.maker.as_slice())
            .bind(fill.taker.as_slice())
            .bind(fill.contract.as_slice())
            .bind(fill.token_id.to_string())
            .bind(fill.amount.to_string())
            .bind(fill.price.to_string())
            .bind(fill.currency.as_slice())
            .execute(&mut *tx)
            .await?;
            inserted += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit().await?;
        debug!(total = fills.len(), inserted, "fills stored");
        Ok(inserted)
    }

    async fn insert_cancels(&self, cancels: &[CancelEvent]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for cancel in cancels {
            let result = sqlx::query(
                r#"
                INSERT INTO cancel_events (
                    tx_hash, log_index, batch_index, block_number, timestamp,
                    protocol, order_id, maker
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (tx_hash, log_index, batch_index) DO NOTHING
                "#,
            )
            .bind(cancel.ctx.tx_hash.as_slice())
            .bind(to_i64(cancel.ctx.log_index))
            .bind(to_i64(cancel.ctx.batch_index))
            .bind(to_i64(cancel.ctx.block_number))
            .bind(to_i64(cancel.ctx.timestamp))
            .bind(cancel.protocol.as_str())
            .bind(cancel.order_id.as_slice())
            .bind(cancel.maker.as_slice())
            .execute(&mut *tx)
            .await?;
            inserted += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn apply_order_update(&self, update: &OrderUpdate) -> Result<bool, StoreError> {
        self.set_status(update.order_id(), update.into(), update.position())
            .await
    }

    async fn apply_bulk_cancel(&self, event: &BulkCancelEvent) -> Result<Vec<B256>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let min_nonce = event.min_nonce.to_string();

        sqlx::query(
            r#"
            INSERT INTO bulk_cancel_events (
                tx_hash, log_index, batch_index, block_number, timestamp,
                protocol, maker, min_nonce
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8::numeric)
            ON CONFLICT (tx_hash, log_index, batch_index) DO NOTHING
            "#,
        )
        .bind(event.ctx.tx_hash.as_slice())
        .bind(to_i64(event.ctx.log_index))
        .bind(to_i64(event.ctx.batch_index))
        .bind(to_i64(event.ctx.block_number))
        .bind(to_i64(event.ctx.timestamp))
        .bind(event.protocol.as_str())
        .bind(event.maker.as_slice())
        .bind(&min_nonce)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO master_nonces (protocol, maker, nonce)
            VALUES ($1, $2, $3::numeric)
            ON CONFLICT (protocol, maker) DO UPDATE
            SET nonce = GREATEST(master_nonces.nonce, EXCLUDED.nonce), updated_at = NOW()
            "#,
        )
        .bind(event.protocol.as_str())
        .bind(event.maker.as_slice())
        .bind(&min_nonce)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "UPDATE orders \
             SET fillability_status = 'cancelled', block_number = $4, log_index = $5, \
                 updated_at = NOW() \
             WHERE protocol = $1 AND maker = $2 AND {} < $3::numeric \
               AND fillability_status NOT IN ('filled', 'cancelled') \
               AND (block_number, log_index) < ($4, $5) \
             RETURNING id",
            bulk_cancel_column(event.protocol)
        );
        let rows = sqlx::query(&sql)
            .bind(event.protocol.as_str())
            .bind(event.maker.as_slice())
            .bind(&min_nonce)
            .bind(to_i64(event.ctx.block_number))
            .bind(to_i64(event.ctx.log_index))
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        ids_from_rows(&rows)
    }

    async fn apply_nonce_invalidation(
        &self,
        event: &NonceInvalidation,
    ) -> Result<Vec<B256>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let nonce = event.nonce.to_string();

        sqlx::query(
            r#"
            INSERT INTO nonce_invalidations (
                protocol, maker, nonce, was_cancellation, tx_hash, log_index, block_number
            )
            VALUES ($1, $2, $3::numeric, $4, $5, $6, $7)
            ON CONFLICT (protocol, maker, nonce) DO NOTHING
            "#,
        )
        .bind(event.protocol.as_str())
        .bind(event.maker.as_slice())
        .bind(&nonce)
        .bind(event.was_cancellation)
        .bind(event.ctx.tx_hash.as_slice())
        .bind(to_i64(event.ctx.log_index))
        .bind(to_i64(event.ctx.block_number))
        .execute(&mut *tx)
        .await?;

        let status = if event.was_cancellation {
            FillabilityStatus::Cancelled
        } else {
            FillabilityStatus::Filled
        };
        let rows = sqlx::query(
            r#"
            UPDATE orders
            SET fillability_status = $4, block_number = $5, log_index = $6, updated_at = NOW()
            WHERE protocol = $1 AND maker = $2 AND nonce = $3::numeric
              AND fillability_status NOT IN ('filled', 'cancelled')
              AND (block_number, log_index) < ($5, $6)
            RETURNING id
            "#,
        )
        .bind(event.protocol.as_str())
        .bind(event.maker.as_slice())
        .bind(&nonce)
        .bind(status.as_str())
        .bind(to_i64(event.ctx.block_number))
        .bind(to_i64(event.ctx.log_index))
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        ids_from_rows(&rows)
    }

    async fn insert_fungible_transfers(
        &self,
        transfers: &[FungibleTransfer],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for transfer in transfers {
            let result = sqlx::query(
                r#"
                INSERT INTO fungible_transfers (
                    tx_hash, log_index, batch_index, block_number, timestamp,
                    from_address, to_address, currency, amount
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::numeric)
                ON CONFLICT (tx_hash, log_index, batch_index) DO NOTHING
                "#,
            )
            .bind(transfer.ctx.tx_hash.as_slice())
            .bind(to_i64(transfer.ctx.log_index))
            .bind(to_i64(transfer.ctx.batch_index))
            .bind(to_i64(transfer.ctx.block_number))
            .bind(to_i64(transfer.ctx.timestamp))
            .bind(transfer.from.as_slice())
            .bind(transfer.to.as_slice())
            .bind(transfer.currency.as_slice())
            .bind(transfer.amount.to_string())
            .execute(&mut *tx)
            .await?;
            inserted += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn insert_swaps(&self, swaps: &[Swap]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for swap in swaps {
            let result = sqlx::query(
                r#"
                INSERT INTO swaps (
                    tx_hash, block_number, timestamp, wallet,
                    from_currency, from_amount, to_currency, to_amount
                )
                VALUES ($1, $2, $3, $4, $5, $6::numeric, $7, $8::numeric)
                ON CONFLICT (tx_hash) DO NOTHING
                "#,
            )
            .bind(swap.ctx.tx_hash.as_slice())
            .bind(to_i64(swap.ctx.block_number))
            .bind(to_i64(swap.ctx.timestamp))
            .bind(swap.wallet.as_slice())
            .bind(swap.from_currency.as_slice())
            .bind(swap.from_amount.to_string())
            .bind(swap.to_currency.as_slice())
            .bind(swap.to_amount.to_string())
            .execute(&mut *tx)
            .await?;
            inserted += usize::try_from(result.rows_affected()).unwrap_or(0);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn master_nonce(
        &self,
        protocol: ProtocolKind,
        maker: Address,
    ) -> Result<U256, StoreError> {
        let row = sqlx::query(
            "SELECT nonce::text AS nonce FROM master_nonces WHERE protocol = $1 AND maker = $2",
        )
        .bind(protocol.as_str())
        .bind(maker.as_slice())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => read_u256(&row, "nonce"),
            None => Ok(U256::ZERO),
        }
    }

    async fn find_order_id(
        &self,
        protocol: ProtocolKind,
        maker: Address,
        nonce: U256,
    ) -> Result<Option<B256>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id FROM orders
            WHERE protocol = $1 AND maker = $2 AND nonce = $3::numeric
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(protocol.as_str())
        .bind(maker.as_slice())
        .bind(nonce.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| read_b256(&r, "id")).transpose()
    }

    async fn get_order(&self, id: B256) -> Result<Option<OrderRecord>, StoreError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_slice())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn orders_by_maker(
        &self,
        maker: Address,
        contract: Option<Address>,
    ) -> Result<Vec<OrderRecord>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE maker = $1 AND ($2::bytea IS NULL OR contract = $2) ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(maker.as_slice())
            .bind(contract.as_ref().map(|c| c.as_slice()))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_from_row).collect()
    }

    async fn upsert_order(&self, order: &OrderRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (
                id, protocol, side, maker, contract, token_id, nonce, price, currency,
                fillability_status, approval_status, block_number, log_index, master_nonce
            )
            VALUES (
                $1, $2, $3, $4, $5, $6::numeric, $7::numeric, $8::numeric, $9,
                $10, $11, $12, $13, $14::numeric
            )
            ON CONFLICT (id) DO UPDATE SET
                protocol = EXCLUDED.protocol,
                side = EXCLUDED.side,
                maker = EXCLUDED.maker,
                contract = EXCLUDED.contract,
                token_id = EXCLUDED.token_id,
                nonce = EXCLUDED.nonce,
                master_nonce = EXCLUDED.master_nonce,
                price = EXCLUDED.price,
                currency = EXCLUDED.currency,
                fillability_status = EXCLUDED.fillability_status,
                approval_status = EXCLUDED.approval_status,
                block_number = EXCLUDED.block_number,
                log_index = EXCLUDED.log_index,
                updated_at = NOW()
            WHERE (orders.block_number, orders.log_index)
                < (EXCLUDED.block_number, EXCLUDED.log_index)
            "#,
        )
        .bind(order.id.as_slice())
        .bind(order.protocol.as_str())
        .bind(order.side.as_str())
        .bind(order.maker.as_slice())
        .bind(order.contract.as_slice())
        .bind(order.token_id.to_string())
        .bind(order.nonce.map(|n| n.to_string()))
        .bind(order.price.to_string())
        .bind(order.currency.as_slice())
        .bind(order.fillability_status.as_str())
        .bind(order.approval_status.as_str())
        .bind(to_i64(order.block_number))
        .bind(to_i64(order.log_index))
        .bind(order.master_nonce.map(|n| n.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revalidate_order(&self, id: B256) -> Result<Option<FillabilityStatus>, StoreError> {
        let Some(order) = self.get_order(id).await? else {
            return Ok(None);
        };
        let master = self.master_nonce(order.protocol, order.maker).await?;
        let invalidated = match order.nonce {
            Some(nonce) => {
                self.nonce_invalidated(order.protocol, order.maker, nonce)
                    .await?
            }
            None => None,
        };

        let Some(status) = nonce_status(&order, master, invalidated) else {
            return Ok(Some(order.fillability_status));
        };
        sqlx::query("UPDATE orders SET fillability_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_slice())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(Some(status))
    }

    async fn recompute_collection(
        &self,
        contract: Address,
        token_id: Option<U256>,
    ) -> Result<CollectionStats, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders \
             WHERE contract = $1 AND ($2::numeric IS NULL OR token_id = $2::numeric) \
               AND fillability_status = 'fillable' AND approval_status = 'approved'"
        );
        let rows = sqlx::query(&sql)
            .bind(contract.as_slice())
            .bind(token_id.map(|id| id.to_string()))
            .fetch_all(&self.pool)
            .await?;
        let orders = rows
            .iter()
            .map(order_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        let stats = CollectionStats::from_orders(contract, token_id, &orders);

        sqlx::query(
            r#"
            INSERT INTO collection_stats (contract, token_key, floor_ask, top_bid)
            VALUES ($1, $2, $3::numeric, $4::numeric)
            ON CONFLICT (contract, token_key) DO UPDATE SET
                floor_ask = EXCLUDED.floor_ask,
                top_bid = EXCLUDED.top_bid,
                updated_at = NOW()
            "#,
        )
        .bind(contract.as_slice())
        .bind(token_key(token_id))
        .bind(stats.floor_ask.map(|p| p.to_string()))
        .bind(stats.top_bid.map(|p| p.to_string()))
        .execute(&self.pool)
        .await?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::tests::ctx;
    use crate::store::tests::order;

    #[test]
    fn test_to_i64_saturates() {
        assert_eq!(to_i64(42), 42);
        assert_eq!(to_i64(u64::MAX), i64::MAX);
    }

    #[test]
    fn test_token_key() {
        assert_eq!(token_key(None), "");
        assert_eq!(token_key(Some(U256::from(9))), "9");
    }

    #[test]
    fn test_parse_u256_from_numeric_text() {
        let max = U256::MAX.to_string();
        assert_eq!(parse_u256("price", &max).expect("parse"), U256::MAX);
        assert!(matches!(
            parse_u256("price", "1.5"),
            Err(StoreError::Corrupt { column: "price", .. })
        ));
    }

    #[test]
    fn test_bulk_cancel_column_matches_record() {
        assert_eq!(
            bulk_cancel_column(ProtocolKind::PaymentProcessorV2),
            "master_nonce"
        );
        assert_eq!(bulk_cancel_column(ProtocolKind::Seaport), "nonce");
        assert!(ORDER_COLUMNS.contains("master_nonce::text AS master_nonce"));
    }

    /// Connects to `DATABASE_URL`, migrates, and clears `maker`'s rows.
    async fn database(maker: Address) -> PgOrderBookStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let store = PgOrderBookStore::connect(&url, 2).await.expect("connect");
        store.migrate().await.expect("migrate");
        for table in ["orders", "master_nonces"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE maker = $1"))
                .bind(maker.as_slice())
                .execute(store.pool())
                .await
                .expect("clear");
        }
        store
    }

    #[tokio::test]
    #[ignore = "needs a postgres database in DATABASE_URL"]
    async fn test_pg_upsert_order_recheck() {
        let maker = Address::repeat_byte(0x51);
        let store = database(maker).await;
        let mut record = order(0x51, OrderSide::Sell, 100);
        record.maker = maker;
        record.master_nonce = Some(U256::MAX);
        record.block_number = 5;
        record.log_index = 2;
        assert!(store.upsert_order(&record).await.expect("insert"));

        let mut stale = record.clone();
        stale.price = U256::from(1);
        assert!(!store.upsert_order(&stale).await.expect("same position"));
        stale.log_index = 1;
        assert!(!store.upsert_order(&stale).await.expect("older position"));

        let stored = store
            .get_order(record.id)
            .await
            .expect("get")
            .expect("order");
        assert_eq!(stored, record);

        stale.block_number = 6;
        stale.log_index = 0;
        assert!(store.upsert_order(&stale).await.expect("newer position"));
        let stored = store
            .get_order(record.id)
            .await
            .expect("get")
            .expect("order");
        assert_eq!(stored.price, U256::from(1));
    }

    #[tokio::test]
    #[ignore = "needs a postgres database in DATABASE_URL"]
    async fn test_pg_bulk_cancel_uses_master_nonce_and_recheck() {
        let maker = Address::repeat_byte(0x52);
        let store = database(maker).await;
        let mut stale = order(0x52, OrderSide::Sell, 100);
        stale.maker = maker;
        stale.nonce = Some(U256::from(1000));
        stale.master_nonce = Some(U256::ZERO);
        let mut current = order(0x53, OrderSide::Sell, 100);
        current.maker = maker;
        current.nonce = Some(U256::ZERO);
        current.master_nonce = Some(U256::from(1));
        store.upsert_order(&stale).await.expect("upsert");
        store.upsert_order(&current).await.expect("upsert");

        let changed = store
            .apply_bulk_cancel(&BulkCancelEvent {
                ctx: ctx(2, 0),
                protocol: ProtocolKind::PaymentProcessorV2,
                maker,
                min_nonce: U256::from(1),
            })
            .await
            .expect("cancel");
        assert_eq!(changed, vec![stale.id]);
        assert_eq!(
            store
                .master_nonce(ProtocolKind::PaymentProcessorV2, maker)
                .await
                .expect("nonce"),
            U256::from(1)
        );

        // A fill logged before the cancel does not overwrite it.
        let late = OrderUpdate::Filled {
            order_id: stale.id,
            block_number: 1,
            log_index: 9,
        };
        assert!(!store.apply_order_update(&late).await.expect("update"));
        let stored = store
            .get_order(stale.id)
            .await
            .expect("get")
            .expect("order");
        assert_eq!(stored.fillability_status, FillabilityStatus::Cancelled);
        assert_eq!(stored.position(), (2, 0));

        assert_eq!(
            store.revalidate_order(current.id).await.expect("revalidate"),
            Some(FillabilityStatus::Fillable)
        );
    }
}
