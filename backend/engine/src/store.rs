//! Ledger accessor — load/save of engine records by integer index.
//!
//! The engine treats persistence as a transactional key-value store, one key
//! space per record kind. [`SqliteStore`] is the production implementation;
//! tests use the in-memory store from `testutil`.
//!
//! Record bodies are stored as JSON so the schema never has to chase the
//! record structs. The `projects.stage` column and the recipient login
//! columns are denormalized copies maintained on every save, for the two
//! queries that need them.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{StoreError, StoreResult};
use crate::stage::Stage;
use crate::types::{Entity, Investor, Project, Recipient};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_project(&self, index: u64) -> StoreResult<Project>;
    async fn save_project(&self, project: &Project) -> StoreResult<()>;
    /// All projects currently at `stage` (used to resume payback monitors).
    async fn projects_at_stage(&self, stage: Stage) -> StoreResult<Vec<Project>>;

    async fn load_investor(&self, index: u64) -> StoreResult<Investor>;
    async fn save_investor(&self, investor: &Investor) -> StoreResult<()>;

    async fn load_recipient(&self, index: u64) -> StoreResult<Recipient>;
    async fn save_recipient(&self, recipient: &Recipient) -> StoreResult<()>;
    /// Credential check consumed by `unlock_project`. Identity management
    /// itself is external; the store only matches username + password hash.
    async fn validate_recipient(&self, username: &str, pwhash: &str) -> StoreResult<Recipient>;

    async fn load_entity(&self, index: u64) -> StoreResult<Entity>;
    async fn save_entity(&self, entity: &Entity) -> StoreResult<()>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Establish the connection pool and run pending migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite:{database_url}")
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("ledger store migrations applied");
        Ok(SqliteStore { pool })
    }

    async fn load_body<T: serde::de::DeserializeOwned>(
        &self,
        query: &str,
        kind: &'static str,
        index: u64,
    ) -> StoreResult<T> {
        let row: Option<(String,)> = sqlx::query_as(query)
            .bind(index as i64)
            .fetch_optional(&self.pool)
            .await?;
        let (body,) = row.ok_or(StoreError::NotFound { kind, index })?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn load_project(&self, index: u64) -> StoreResult<Project> {
        self.load_body("SELECT body FROM projects WHERE idx = ?1", "project", index)
            .await
    }

    async fn save_project(&self, project: &Project) -> StoreResult<()> {
        let body = serde_json::to_string(project)?;
        sqlx::query(
            r#"
            INSERT INTO projects (idx, stage, body) VALUES (?1, ?2, ?3)
            ON CONFLICT(idx) DO UPDATE SET stage = excluded.stage, body = excluded.body
            "#,
        )
        .bind(project.index as i64)
        .bind(u8::from(project.stage) as i64)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn projects_at_stage(&self, stage: Stage) -> StoreResult<Vec<Project>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM projects WHERE stage = ?1 ORDER BY idx ASC")
                .bind(u8::from(stage) as i64)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(body,)| serde_json::from_str(&body).map_err(StoreError::from))
            .collect()
    }

    async fn load_investor(&self, index: u64) -> StoreResult<Investor> {
        self.load_body("SELECT body FROM investors WHERE idx = ?1", "investor", index)
            .await
    }

    async fn save_investor(&self, investor: &Investor) -> StoreResult<()> {
        let body = serde_json::to_string(investor)?;
        sqlx::query(
            r#"
            INSERT INTO investors (idx, body) VALUES (?1, ?2)
            ON CONFLICT(idx) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(investor.index as i64)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_recipient(&self, index: u64) -> StoreResult<Recipient> {
        self.load_body("SELECT body FROM recipients WHERE idx = ?1", "recipient", index)
            .await
    }

    async fn save_recipient(&self, recipient: &Recipient) -> StoreResult<()> {
        let body = serde_json::to_string(recipient)?;
        sqlx::query(
            r#"
            INSERT INTO recipients (idx, username, pwhash, body) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(idx) DO UPDATE SET
                username = excluded.username,
                pwhash   = excluded.pwhash,
                body     = excluded.body
            "#,
        )
        .bind(recipient.index as i64)
        .bind(&recipient.username)
        .bind(&recipient.pwhash)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn validate_recipient(&self, username: &str, pwhash: &str) -> StoreResult<Recipient> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM recipients WHERE username = ?1 AND pwhash = ?2")
                .bind(username)
                .bind(pwhash)
                .fetch_optional(&self.pool)
                .await?;
        let (body,) = row.ok_or(StoreError::InvalidCredentials)?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn load_entity(&self, index: u64) -> StoreResult<Entity> {
        self.load_body("SELECT body FROM entities WHERE idx = ?1", "entity", index)
            .await
    }

    async fn save_entity(&self, entity: &Entity) -> StoreResult<()> {
        let body = serde_json::to_string(entity)?;
        sqlx::query(
            r#"
            INSERT INTO entities (idx, body) VALUES (?1, ?2)
            ON CONFLICT(idx) DO UPDATE SET body = excluded.body
            "#,
        )
        .bind(entity.index as i64)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
