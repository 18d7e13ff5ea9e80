//! [`PgWarehouse`] - the Postgres implementation of [`Warehouse`].

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};

use crate::persist::warehouse::{ColumnInfo, Warehouse};
use crate::schema::Value;
use crate::Result;

/// Star schema DDL. Applied with `IF NOT EXISTS`, so existing tables are
/// left as they are.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS calendar (
    id          INTEGER PRIMARY KEY,
    date_value  INTEGER NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS location (
    id          INTEGER PRIMARY KEY,
    country     TEXT NOT NULL UNIQUE,
    continent   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS disease (
    id          INTEGER PRIMARY KEY,
    type        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data (
    id            INTEGER PRIMARY KEY,
    total_cases   BIGINT NOT NULL,
    total_deaths  BIGINT NOT NULL,
    new_cases     BIGINT NOT NULL,
    new_deaths    BIGINT NOT NULL,
    id_location   INTEGER NOT NULL REFERENCES location (id),
    id_disease    INTEGER NOT NULL REFERENCES disease (id),
    id_calendar   INTEGER NOT NULL REFERENCES calendar (id)
);
"#;

/// A warehouse on a single pooled connection.
///
/// One connection keeps session settings (the referential-check toggle) in
/// effect for every statement of the load. Inserts open a transaction
/// lazily; `commit`/`rollback` close it.
pub struct PgWarehouse {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgWarehouse {
    /// Connect and authenticate. Failure here aborts the relational load.
    pub async fn connect(options: PgConnectOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool, tx: None })
    }

    /// Create the four tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, sqlx::Error> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.tx.insert(tx))
    }
}

fn insert_builder<'a>(
    table: &str,
    columns: &[&str],
    rows: Vec<Vec<Value>>,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!("INSERT INTO {table} ({}) ", columns.join(", ")));
    qb.push_values(rows, |mut b, row| {
        for value in row {
            match value {
                Value::Int(n) => b.push_bind(n),
                Value::Text(s) => b.push_bind(s),
            };
        }
    });
    qb
}

impl Warehouse for PgWarehouse {
    type Error = sqlx::Error;

    async fn describe_table(
        &mut self,
        table: &'static str,
    ) -> Result<Vec<ColumnInfo>, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, data_type)| ColumnInfo { name, data_type })
            .collect())
    }

    async fn set_referential_checks(&mut self, enabled: bool) -> Result<(), sqlx::Error> {
        let sql = if enabled {
            "SET session_replication_role = DEFAULT"
        } else {
            "SET session_replication_role = replica"
        };
        // Needs elevated privileges. Without them truncation still works
        // because TRUNCATE ... CASCADE handles the foreign keys.
        if let Err(e) = sqlx::query(sql).execute(&self.pool).await {
            tracing::warn!(
                enabled,
                error = %e,
                "cannot toggle referential checks, relying on cascade"
            );
        }
        Ok(())
    }

    async fn truncate(&mut self, table: &'static str) -> Result<(), sqlx::Error> {
        sqlx::query(&format!("TRUNCATE TABLE {table} CASCADE"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_row(
        &mut self,
        table: &'static str,
        columns: &'static [&'static str],
        row: Vec<Value>,
    ) -> Result<(), sqlx::Error> {
        let mut qb = insert_builder(table, columns, vec![row]);
        let tx = self.tx().await?;
        qb.build().execute(&mut **tx).await?;
        Ok(())
    }

    async fn insert_batch(
        &mut self,
        table: &'static str,
        columns: &'static [&'static str],
        rows: Vec<Vec<Value>>,
    ) -> Result<u64, sqlx::Error> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut qb = insert_builder(table, columns, rows);
        let tx = self.tx().await?;
        let result = qb.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), sqlx::Error> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }

    async fn count_rows(&mut self, table: &'static str) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
