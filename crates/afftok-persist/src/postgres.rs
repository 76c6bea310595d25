//! Postgres `ClickStore` driver (feature `postgres`).
//!
//! Batch inserts use a single multi-row `INSERT`; the per-user-offer stat
//! deltas ride in the same transaction so a crash can never record a click
//! without its aggregate (or the reverse).

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use afftok_types::{ClickEvent, Conversion, UserOfferId};

use crate::store::{ClickStore, ConversionOutcome};
use crate::{StoreError, StoreResult};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

/// Postgres-backed click store.
#[derive(Clone)]
pub struct PgClickStore {
    pool: PgPool,
}

impl PgClickStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        info!("connected to postgres");
        Ok(store)
    }

    /// Wrap an existing pool (tests, shared pools).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS clicks (
                id UUID PRIMARY KEY,
                user_offer_id UUID NOT NULL,
                ip TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                device TEXT NOT NULL,
                browser TEXT NOT NULL,
                os TEXT NOT NULL,
                country TEXT NOT NULL,
                city TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                referrer TEXT NOT NULL,
                clicked_at TIMESTAMPTZ NOT NULL,
                is_unique BOOLEAN NOT NULL,
                risk_score REAL NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_clicks_user_offer ON clicks (user_offer_id)",
            r#"CREATE TABLE IF NOT EXISTS user_offer_stats (
                user_offer_id UUID PRIMARY KEY,
                clicks BIGINT NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS conversions (
                id UUID PRIMARY KEY,
                click_id UUID NOT NULL,
                order_id TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (click_id, order_id)
            )"#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn click_from_row(row: &sqlx::postgres::PgRow) -> Result<ClickEvent, sqlx::Error> {
        Ok(ClickEvent {
            id: row.try_get("id")?,
            user_offer_id: row.try_get("user_offer_id")?,
            ip: row.try_get("ip")?,
            user_agent: row.try_get("user_agent")?,
            device: row.try_get("device")?,
            browser: row.try_get("browser")?,
            os: row.try_get("os")?,
            country: row.try_get("country")?,
            city: row.try_get("city")?,
            fingerprint: row.try_get("fingerprint")?,
            referrer: row.try_get("referrer")?,
            clicked_at: row.try_get("clicked_at")?,
            is_unique: row.try_get("is_unique")?,
            risk_score: row.try_get("risk_score")?,
        })
    }
}

#[async_trait]
impl ClickStore for PgClickStore {
    async fn insert_click_batch(
        &self,
        clicks: &[ClickEvent],
        counter_deltas: &HashMap<UserOfferId, i64>,
    ) -> StoreResult<()> {
        if clicks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        let mut builder: sqlx::QueryBuilder<sqlx::Postgres> = sqlx::QueryBuilder::new(
            "INSERT INTO clicks (id, user_offer_id, ip, user_agent, device, browser, os, \
             country, city, fingerprint, referrer, clicked_at, is_unique, risk_score) ",
        );
        builder.push_values(clicks.iter(), |mut row, click| {
            row.push_bind(click.id)
                .push_bind(click.user_offer_id)
                .push_bind(&click.ip)
                .push_bind(&click.user_agent)
                .push_bind(&click.device)
                .push_bind(&click.browser)
                .push_bind(&click.os)
                .push_bind(&click.country)
                .push_bind(&click.city)
                .push_bind(&click.fingerprint)
                .push_bind(&click.referrer)
                .push_bind(click.clicked_at)
                .push_bind(click.is_unique)
                .push_bind(click.risk_score);
        });
        // Ids are pre-assigned; a replayed batch must not double-insert.
        builder.push(" ON CONFLICT (id) DO NOTHING");
        builder.build().execute(&mut *tx).await?;

        for (user_offer_id, delta) in counter_deltas {
            sqlx::query(
                "INSERT INTO user_offer_stats (user_offer_id, clicks) VALUES ($1, $2) \
                 ON CONFLICT (user_offer_id) DO UPDATE \
                 SET clicks = user_offer_stats.clicks + EXCLUDED.clicks",
            )
            .bind(user_offer_id)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn click_count(&self, user_offer_id: UserOfferId) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM clicks WHERE user_offer_id = $1")
            .bind(user_offer_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    async fn find_click(&self, id: Uuid) -> StoreResult<Option<ClickEvent>> {
        let row = sqlx::query("SELECT * FROM clicks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(Self::click_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn record_conversion(&self, conversion: &Conversion) -> StoreResult<ConversionOutcome> {
        let inserted = sqlx::query(
            "INSERT INTO conversions (id, click_id, order_id, amount, currency, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (click_id, order_id) DO NOTHING RETURNING id",
        )
        .bind(conversion.id)
        .bind(conversion.click_id)
        .bind(&conversion.order_id)
        .bind(conversion.amount)
        .bind(&conversion.currency)
        .bind(&conversion.status)
        .bind(conversion.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(ConversionOutcome::Created(row.try_get("id")?));
        }

        let existing = sqlx::query("SELECT id FROM conversions WHERE click_id = $1 AND order_id = $2")
            .bind(conversion.click_id)
            .bind(&conversion.order_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(ConversionOutcome::Existing(existing.try_get("id")?))
    }
}
