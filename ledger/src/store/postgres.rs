//! PostgreSQL ledger store.
//!
//! A unit of work is one database transaction. `get_for_update` takes a row
//! lock with `SELECT ... FOR UPDATE`; the transaction-local `lock_timeout`
//! bounds the wait. Dropping a unit drops the transaction, which rolls back.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use sellercredit_common::{
    CreditError, CreditId, DepositId, LogId, Result, SaleId, SellerId, UserId,
};

use crate::config::LedgerConfig;
use crate::credit::Credit;
use crate::deposit::{DepositRequest, DepositStatus};
use crate::sale::Sale;
use crate::seller::Seller;
use crate::store::{LedgerStore, Page, UnitOfWork};
use crate::transaction_log::{LogTotals, LogType, TransactionLog};

/// Schema statements applied by [`PgLedgerStore::migrate`], in order.
pub const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sellers (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL UNIQUE,
        first_name VARCHAR(55),
        last_name VARCHAR(55),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credits (
        id UUID PRIMARY KEY,
        seller_id UUID NOT NULL UNIQUE REFERENCES sellers(id) ON DELETE CASCADE,
        balance NUMERIC(10, 2) NOT NULL CHECK (balance >= 0),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credit_transaction_logs (
        id BIGSERIAL PRIMARY KEY,
        credit_id UUID NOT NULL REFERENCES credits(id) ON DELETE CASCADE,
        amount NUMERIC(10, 2) NOT NULL CHECK (amount > 0),
        type VARCHAR(8) NOT NULL CHECK (type IN ('DEPOSIT', 'SALE')),
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS credit_transaction_logs_credit_type
        ON credit_transaction_logs (credit_id, type)",
    "CREATE TABLE IF NOT EXISTS sales (
        id UUID PRIMARY KEY,
        seller_id UUID NOT NULL REFERENCES sellers(id) ON DELETE CASCADE,
        amount NUMERIC(10, 2) NOT NULL CHECK (amount > 0),
        phone_number VARCHAR(15) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS sales_seller ON sales (seller_id, created_at)",
    "CREATE TABLE IF NOT EXISTS deposit_requests (
        id UUID PRIMARY KEY,
        seller_id UUID NOT NULL REFERENCES sellers(id) ON DELETE CASCADE,
        credit_id UUID NOT NULL REFERENCES credits(id) ON DELETE CASCADE,
        amount NUMERIC(10, 2) NOT NULL CHECK (amount > 0),
        status VARCHAR(8) NOT NULL CHECK (status IN ('PENDING', 'APPROVED', 'REJECTED')),
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS deposit_requests_seller
        ON deposit_requests (seller_id, created_at)",
];

const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

fn storage_error(err: sqlx::Error) -> CreditError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            warn!(error = %db, "Row lock wait exceeded lock_timeout");
            return CreditError::ConflictTimeout("credit row lock".to_string());
        }
    }
    error!(error = %err, "Database error");
    CreditError::StorageFailure(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn page_bounds(page: Page) -> (i64, i64) {
    (
        i64::try_from(page.limit).unwrap_or(i64::MAX),
        i64::try_from(page.offset).unwrap_or(i64::MAX),
    )
}

fn seller_from_row(row: &PgRow) -> Result<Seller> {
    Ok(Seller {
        id: SellerId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage_error)?),
        user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id").map_err(storage_error)?),
        first_name: row.try_get("first_name").map_err(storage_error)?,
        last_name: row.try_get("last_name").map_err(storage_error)?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        updated_at: row.try_get("updated_at").map_err(storage_error)?,
    })
}

fn credit_from_row(row: &PgRow) -> Result<Credit> {
    Ok(Credit {
        id: CreditId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage_error)?),
        seller_id: SellerId::from_uuid(
            row.try_get::<Uuid, _>("seller_id").map_err(storage_error)?,
        ),
        balance: row.try_get("balance").map_err(storage_error)?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        updated_at: row.try_get("updated_at").map_err(storage_error)?,
    })
}

fn log_from_row(row: &PgRow) -> Result<TransactionLog> {
    let log_type: String = row.try_get("type").map_err(storage_error)?;
    Ok(TransactionLog {
        id: LogId::new(row.try_get::<i64, _>("id").map_err(storage_error)?),
        credit_id: CreditId::from_uuid(
            row.try_get::<Uuid, _>("credit_id").map_err(storage_error)?,
        ),
        amount: row.try_get("amount").map_err(storage_error)?,
        log_type: log_type.parse()?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
    })
}

fn sale_from_row(row: &PgRow) -> Result<Sale> {
    Ok(Sale {
        id: SaleId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage_error)?),
        seller_id: SellerId::from_uuid(
            row.try_get::<Uuid, _>("seller_id").map_err(storage_error)?,
        ),
        amount: row.try_get("amount").map_err(storage_error)?,
        phone_number: row.try_get("phone_number").map_err(storage_error)?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
    })
}

fn deposit_from_row(row: &PgRow) -> Result<DepositRequest> {
    let status: String = row.try_get("status").map_err(storage_error)?;
    Ok(DepositRequest {
        id: DepositId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage_error)?),
        seller_id: SellerId::from_uuid(
            row.try_get::<Uuid, _>("seller_id").map_err(storage_error)?,
        ),
        credit_id: CreditId::from_uuid(
            row.try_get::<Uuid, _>("credit_id").map_err(storage_error)?,
        ),
        amount: row.try_get("amount").map_err(storage_error)?,
        status: status.parse()?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        updated_at: row.try_get("updated_at").map_err(storage_error)?,
    })
}

const CREDIT_COLUMNS: &str = "id, seller_id, balance, created_at, updated_at";
const SELLER_COLUMNS: &str = "id, user_id, first_name, last_name, created_at, updated_at";
const DEPOSIT_COLUMNS: &str = "id, seller_id, credit_id, amount, status, created_at, updated_at";

/// PostgreSQL implementation of [`LedgerStore`].
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    lock_timeout_ms: u64,
}

impl PgLedgerStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, config: &LedgerConfig) -> Self {
        Self {
            pool,
            lock_timeout_ms: config.lock_timeout.as_millis() as u64,
        }
    }

    /// Connect to a database URL.
    pub async fn connect(database_url: &str, config: &LedgerConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(config.lock_timeout)
            .connect(database_url)
            .await
            .map_err(storage_error)?;

        info!("Connected to ledger database");
        Ok(Self::new(pool, config))
    }

    /// Create tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        }
        info!(statements = SCHEMA.len(), "Ledger schema applied");
        Ok(())
    }

    async fn ensure_credit_exists(&self, credit_id: CreditId) -> Result<()> {
        let row = sqlx::query("SELECT 1 AS present FROM credits WHERE id = $1")
            .bind(*credit_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.map(|_| ())
            .ok_or_else(|| CreditError::not_found("credit", credit_id))
    }
}

/// Unit of work backed by a PostgreSQL transaction.
pub struct PgUnit {
    tx: Transaction<'static, Postgres>,
    locked: HashMap<SellerId, CreditId>,
}

impl PgUnit {
    fn require_lock(&self, seller_id: SellerId, operation: &str) -> Result<()> {
        if self.locked.contains_key(&seller_id) {
            Ok(())
        } else {
            Err(CreditError::StorageFailure(format!(
                "{operation} without holding the credit lock for seller {seller_id}"
            )))
        }
    }
}

#[async_trait]
impl UnitOfWork for PgUnit {
    #[instrument(skip(self))]
    async fn get_for_update(&mut self, seller_id: SellerId) -> Result<Credit> {
        let row = sqlx::query(&format!(
            "SELECT {CREDIT_COLUMNS} FROM credits WHERE seller_id = $1 FOR UPDATE"
        ))
        .bind(*seller_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CreditError::not_found("credit", seller_id))?;

        let credit = credit_from_row(&row)?;
        self.locked.insert(seller_id, credit.id);
        Ok(credit)
    }

    async fn save(&mut self, credit: &Credit) -> Result<()> {
        self.require_lock(credit.seller_id, "save")?;

        sqlx::query("UPDATE credits SET balance = $1, updated_at = $2 WHERE id = $3")
            .bind(credit.balance)
            .bind(credit.updated_at)
            .bind(*credit.id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn append_log(
        &mut self,
        credit_id: CreditId,
        amount: Decimal,
        log_type: LogType,
    ) -> Result<TransactionLog> {
        if !self.locked.values().any(|locked| *locked == credit_id) {
            return Err(CreditError::StorageFailure(format!(
                "append_log for credit {credit_id} outside its lock"
            )));
        }
        if amount <= Decimal::ZERO {
            return Err(CreditError::invalid_amount(
                amount,
                "log amounts must be positive",
            ));
        }

        let created_at: DateTime<Utc> = Utc::now();
        let row = sqlx::query(
            "INSERT INTO credit_transaction_logs (credit_id, amount, type, created_at)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(*credit_id.as_uuid())
        .bind(amount)
        .bind(log_type.as_str())
        .bind(created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        Ok(TransactionLog {
            id: LogId::new(row.try_get::<i64, _>("id").map_err(storage_error)?),
            credit_id,
            amount,
            log_type,
            created_at,
        })
    }

    async fn insert_sale(&mut self, sale: Sale) -> Result<Sale> {
        self.require_lock(sale.seller_id, "insert_sale")?;

        sqlx::query(
            "INSERT INTO sales (id, seller_id, amount, phone_number, created_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(*sale.id.as_uuid())
        .bind(*sale.seller_id.as_uuid())
        .bind(sale.amount)
        .bind(&sale.phone_number)
        .bind(sale.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(sale)
    }

    async fn deposit_for_update(&mut self, deposit_id: DepositId) -> Result<DepositRequest> {
        let row = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposit_requests WHERE id = $1 FOR UPDATE"
        ))
        .bind(*deposit_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CreditError::not_found("deposit request", deposit_id))?;

        let deposit = deposit_from_row(&row)?;
        self.require_lock(deposit.seller_id, "deposit_for_update")?;
        Ok(deposit)
    }

    async fn save_deposit(&mut self, deposit: &DepositRequest) -> Result<()> {
        self.require_lock(deposit.seller_id, "save_deposit")?;

        sqlx::query("UPDATE deposit_requests SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(deposit.status.as_str())
            .bind(deposit.updated_at)
            .bind(*deposit.id.as_uuid())
            .execute(&mut *self.tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(storage_error)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Unit = PgUnit;

    async fn begin(&self) -> Result<PgUnit> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        // SET does not take bind parameters; the value is an integer we own.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout_ms
        ))
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        Ok(PgUnit {
            tx,
            locked: HashMap::new(),
        })
    }

    #[instrument(skip(self, seller), fields(seller_id = %seller.id))]
    async fn create_seller(&self, seller: Seller) -> Result<(Seller, Credit)> {
        let credit = Credit::zero(seller.id);
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let inserted = sqlx::query(&format!(
            "INSERT INTO sellers ({SELLER_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"
        ))
        .bind(*seller.id.as_uuid())
        .bind(*seller.user_id.as_uuid())
        .bind(&seller.first_name)
        .bind(&seller.last_name)
        .bind(seller.created_at)
        .bind(seller.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(CreditError::invalid_field(
                    "user",
                    format!("user {} already has a seller", seller.user_id),
                ));
            }
            return Err(storage_error(err));
        }

        sqlx::query(&format!(
            "INSERT INTO credits ({CREDIT_COLUMNS}) VALUES ($1, $2, $3, $4, $5)"
        ))
        .bind(*credit.id.as_uuid())
        .bind(*credit.seller_id.as_uuid())
        .bind(credit.balance)
        .bind(credit.created_at)
        .bind(credit.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        tx.commit().await.map_err(storage_error)?;
        Ok((seller, credit))
    }

    async fn update_seller(&self, seller: Seller) -> Result<Seller> {
        let row = sqlx::query(&format!(
            "UPDATE sellers SET first_name = $1, last_name = $2, updated_at = $3
             WHERE id = $4 RETURNING {SELLER_COLUMNS}"
        ))
        .bind(&seller.first_name)
        .bind(&seller.last_name)
        .bind(seller.updated_at)
        .bind(*seller.id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CreditError::not_found("seller", seller.id))?;
        seller_from_row(&row)
    }

    async fn seller(&self, seller_id: SellerId) -> Result<Seller> {
        let row = sqlx::query(&format!("SELECT {SELLER_COLUMNS} FROM sellers WHERE id = $1"))
            .bind(*seller_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?
            .ok_or_else(|| CreditError::not_found("seller", seller_id))?;
        seller_from_row(&row)
    }

    async fn seller_for_user(&self, user_id: UserId) -> Result<Seller> {
        let row = sqlx::query(&format!(
            "SELECT {SELLER_COLUMNS} FROM sellers WHERE user_id = $1"
        ))
        .bind(*user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CreditError::not_found("seller for user", user_id))?;
        seller_from_row(&row)
    }

    async fn credit_for_seller(&self, seller_id: SellerId) -> Result<Credit> {
        let row = sqlx::query(&format!(
            "SELECT {CREDIT_COLUMNS} FROM credits WHERE seller_id = $1"
        ))
        .bind(*seller_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CreditError::not_found("credit", seller_id))?;
        credit_from_row(&row)
    }

    async fn sum_by_type(&self, credit_id: CreditId, log_type: LogType) -> Result<Decimal> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS total
             FROM credit_transaction_logs WHERE credit_id = $1 AND type = $2",
        )
        .bind(*credit_id.as_uuid())
        .bind(log_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        row.try_get("total").map_err(storage_error)
    }

    async fn log_totals(&self, credit_id: CreditId) -> Result<LogTotals> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(amount) FILTER (WHERE type = 'DEPOSIT'), 0) AS deposits,
                COALESCE(SUM(amount) FILTER (WHERE type = 'SALE'), 0) AS sales,
                COUNT(*) AS entries
             FROM credit_transaction_logs WHERE credit_id = $1",
        )
        .bind(*credit_id.as_uuid())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        let entries: i64 = row.try_get("entries").map_err(storage_error)?;
        Ok(LogTotals {
            deposits: row.try_get("deposits").map_err(storage_error)?,
            sales: row.try_get("sales").map_err(storage_error)?,
            entries: entries.max(0) as u64,
        })
    }

    async fn logs_for_credit(
        &self,
        credit_id: CreditId,
        page: Page,
    ) -> Result<Vec<TransactionLog>> {
        self.ensure_credit_exists(credit_id).await?;
        let (limit, offset) = page_bounds(page);

        let rows = sqlx::query(
            "SELECT id, credit_id, amount, type, created_at
             FROM credit_transaction_logs WHERE credit_id = $1
             ORDER BY id LIMIT $2 OFFSET $3",
        )
        .bind(*credit_id.as_uuid())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(log_from_row).collect()
    }

    async fn sale(&self, sale_id: SaleId) -> Result<Sale> {
        let row = sqlx::query(
            "SELECT id, seller_id, amount, phone_number, created_at FROM sales WHERE id = $1",
        )
        .bind(*sale_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CreditError::not_found("sale", sale_id))?;
        sale_from_row(&row)
    }

    async fn sales_for_seller(&self, seller_id: SellerId, page: Page) -> Result<Vec<Sale>> {
        let (limit, offset) = page_bounds(page);
        let rows = sqlx::query(
            "SELECT id, seller_id, amount, phone_number, created_at FROM sales
             WHERE seller_id = $1 ORDER BY created_at, id LIMIT $2 OFFSET $3",
        )
        .bind(*seller_id.as_uuid())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(sale_from_row).collect()
    }

    async fn insert_deposit(&self, deposit: DepositRequest) -> Result<DepositRequest> {
        sqlx::query(&format!(
            "INSERT INTO deposit_requests ({DEPOSIT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        ))
        .bind(*deposit.id.as_uuid())
        .bind(*deposit.seller_id.as_uuid())
        .bind(*deposit.credit_id.as_uuid())
        .bind(deposit.amount)
        .bind(deposit.status.as_str())
        .bind(deposit.created_at)
        .bind(deposit.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(deposit)
    }

    async fn deposit(&self, deposit_id: DepositId) -> Result<DepositRequest> {
        let row = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposit_requests WHERE id = $1"
        ))
        .bind(*deposit_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| CreditError::not_found("deposit request", deposit_id))?;
        deposit_from_row(&row)
    }

    async fn deposits_for_seller(
        &self,
        seller_id: SellerId,
        page: Page,
    ) -> Result<Vec<DepositRequest>> {
        let (limit, offset) = page_bounds(page);
        let rows = sqlx::query(&format!(
            "SELECT {DEPOSIT_COLUMNS} FROM deposit_requests
             WHERE seller_id = $1 ORDER BY created_at, id LIMIT $2 OFFSET $3"
        ))
        .bind(*seller_id.as_uuid())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(deposit_from_row).collect()
    }

    async fn approved_deposit_total(&self, credit_id: CreditId) -> Result<Decimal> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(amount), 0) AS total
             FROM deposit_requests WHERE credit_id = $1 AND status = $2",
        )
        .bind(*credit_id.as_uuid())
        .bind(DepositStatus::Approved.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        row.try_get("total").map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        assert_eq!(page_bounds(Page::new(20, 40)), (20, 40));
        assert_eq!(page_bounds(Page::new(usize::MAX, 0)).0, i64::MAX);
    }

    #[test]
    fn test_schema_enforces_invariants() {
        let credits = SCHEMA
            .iter()
            .find(|statement| statement.contains("TABLE IF NOT EXISTS credits"))
            .unwrap();
        assert!(credits.contains("CHECK (balance >= 0)"));
        assert!(credits.contains("ON DELETE CASCADE"));

        let logs = SCHEMA
            .iter()
            .find(|statement| statement.contains("credit_transaction_logs ("))
            .unwrap();
        assert!(logs.contains("CHECK (amount > 0)"));
    }
}
