/* This file is part of cryptobak.
 *
 * cryptobak is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * cryptobak is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with cryptobak.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Sqlite-backed client registry: the production implementation of
//! [`ClientRegistry`], persisting records across restarts.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use uuid::Uuid;

use super::{now_unix, ClientRecord, ClientRegistry};
use crate::crypto::PUBLIC_KEY_WIRE_SIZE;
use crate::wire::SESSION_KEY_SIZE;

const BUSY_RETRY_ATTEMPTS: u32 = 5;
const BUSY_RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

pub struct SqliteRegistry {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct ClientRow {
    id: String,
    name: String,
    public_key: Option<Vec<u8>>,
    session_key: Option<Vec<u8>>,
    last_seen: i64,
}

impl TryFrom<ClientRow> for ClientRecord {
    type Error = anyhow::Error;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn try_from(row: ClientRow) -> Result<Self> {
        let id = Uuid::from_str(&row.id).context("corrupt client id in registry")?;
        let public_key = row
            .public_key
            .map(|bytes| {
                let arr: [u8; PUBLIC_KEY_WIRE_SIZE] = bytes
                    .try_into()
                    .map_err(|_| anyhow!("corrupt public key length in registry"))?;
                Ok::<_, anyhow::Error>(arr)
            })
            .transpose()?;
        let session_key = row
            .session_key
            .map(|bytes| {
                let arr: [u8; SESSION_KEY_SIZE] = bytes
                    .try_into()
                    .map_err(|_| anyhow!("corrupt session key length in registry"))?;
                Ok::<_, anyhow::Error>(arr)
            })
            .transpose()?;
        Ok(ClientRecord {
            id,
            name: row.name,
            public_key,
            session_key,
            last_seen: row.last_seen as u32,
        })
    }
}

impl SqliteRegistry {
    const SCHEMA_VERSION: i32 = 1;

    pub async fn new(db_uri: &str) -> Result<Self> {
        let registry = if db_uri.contains(":memory:") {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(db_uri)
                .await
                .context("opening in-memory sqlite registry")?;
            Self { pool }
        } else {
            let options = SqliteConnectOptions::from_str(db_uri)?.create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await
                .context("opening sqlite registry")?;
            Self { pool }
        };

        registry.init_schema().await?;
        Ok(registry)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS meta (name TEXT NOT NULL UNIQUE, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        let schema_version: Option<i32> =
            sqlx::query("SELECT value FROM meta WHERE name = 'schema_version'")
                .fetch_optional(&self.pool)
                .await?
                .map(|row| {
                    let version_str: String = row.get(0);
                    version_str.parse::<i32>()
                })
                .transpose()?;

        match schema_version {
            Some(Self::SCHEMA_VERSION) => Ok(()),
            None => {
                debug!("initializing registry schema");
                sqlx::raw_sql(include_str!("sqlite_schema.sql")).execute(&self.pool).await?;
                sqlx::query("INSERT INTO meta (name, value) VALUES ('schema_version', $1)")
                    .bind(Self::SCHEMA_VERSION)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            Some(version) => Err(anyhow!("unexpected registry schema version {version}")),
        }
    }

    /// Retries `op` with exponential backoff while sqlite reports the
    /// database as locked/busy, per SPEC_FULL §2. A single-writer sqlite
    /// file under concurrent client sessions hits this in normal operation,
    /// not just under fault conditions.
    async fn with_busy_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt < BUSY_RETRY_ATTEMPTS => {
                    let delay = BUSY_RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!("registry busy, retrying in {delay:?} (attempt {attempt})");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.message().contains("database is locked") || db_err.message().contains("busy")
        }
        _ => false,
    }
}

#[async_trait]
impl ClientRegistry for SqliteRegistry {
    async fn register(&self, name: &str) -> Result<ClientRecord> {
        let id = Uuid::new_v4();
        let id_str = id.to_string();
        let last_seen = now_unix();
        self.with_busy_retry(|| {
            sqlx::query(
                "INSERT INTO clients (id, name, public_key, session_key, last_seen) \
                 VALUES ($1, $2, NULL, NULL, $3)",
            )
            .bind(&id_str)
            .bind(name)
            .bind(i64::from(last_seen))
            .execute(&self.pool)
        })
        .await
        .map_err(|err| anyhow!("client name '{name}' is already registered: {err}"))?;
        Ok(ClientRecord::new(id, name, last_seen))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ClientRecord>> {
        let id_str = id.to_string();
        let row: Option<ClientRow> = sqlx::query_as(
            "SELECT id, name, public_key, session_key, last_seen FROM clients WHERE id = $1",
        )
        .bind(&id_str)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ClientRecord::try_from).transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ClientRecord>> {
        let row: Option<ClientRow> = sqlx::query_as(
            "SELECT id, name, public_key, session_key, last_seen FROM clients \
             WHERE name = $1 COLLATE NOCASE",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ClientRecord::try_from).transpose()
    }

    async fn set_public_key(
        &self,
        id: Uuid,
        public_key: [u8; PUBLIC_KEY_WIRE_SIZE],
    ) -> Result<()> {
        let id_str = id.to_string();
        let key_vec = public_key.to_vec();
        let result = self
            .with_busy_retry(|| {
                sqlx::query("UPDATE clients SET public_key = $1 WHERE id = $2")
                    .bind(&key_vec)
                    .bind(&id_str)
                    .execute(&self.pool)
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("no such client {id}"));
        }
        Ok(())
    }

    async fn record_key_exchange(&self, id: Uuid, session_key: [u8; SESSION_KEY_SIZE]) -> Result<()> {
        let id_str = id.to_string();
        let key_vec = session_key.to_vec();
        let last_seen = i64::from(now_unix());
        let result = self
            .with_busy_retry(|| {
                sqlx::query("UPDATE clients SET session_key = $1, last_seen = $2 WHERE id = $3")
                    .bind(&key_vec)
                    .bind(last_seen)
                    .bind(&id_str)
                    .execute(&self.pool)
            })
            .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!("no such client {id}"));
        }
        Ok(())
    }

    async fn record_file_outcome(
        &self,
        client_id: Uuid,
        filename: &str,
        storage_path: Option<&str>,
        verified: bool,
    ) -> Result<()> {
        let id_str = client_id.to_string();
        self.with_busy_retry(|| {
            sqlx::query(
                "INSERT INTO files (client_id, filename, storage_path, verified) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT(client_id, filename) DO UPDATE SET \
                 storage_path = COALESCE(excluded.storage_path, files.storage_path), \
                 verified = excluded.verified",
            )
            .bind(&id_str)
            .bind(filename)
            .bind(storage_path)
            .bind(verified)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }
}
