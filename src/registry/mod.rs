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

//! The persistent client registry (spec §3, §4.6): one record per
//! registered client, keyed by a server-issued identifier and also
//! uniquely by name. Two backends share a common async trait: a
//! sqlite-backed store for production and an in-memory store for tests.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::wire::SESSION_KEY_SIZE;

/// A registered client as persisted across restarts (spec §3 `ClientRecord`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRecord {
    pub id: Uuid,
    pub name: String,
    /// The client's RSA public key, in its 160-byte wire form.
    pub public_key: Option<[u8; crate::crypto::PUBLIC_KEY_WIRE_SIZE]>,
    /// The most recently issued AES session key, replaced on every
    /// key-exchange (spec §3 `ClientRecord`); `None` until the first one.
    pub session_key: Option<[u8; SESSION_KEY_SIZE]>,
    /// Unix timestamp (seconds) of the last successful key-exchange.
    pub last_seen: u32,
}

impl ClientRecord {
    pub fn new(id: Uuid, name: impl Into<String>, last_seen: u32) -> Self {
        Self { id, name: name.into(), public_key: None, session_key: None, last_seen }
    }
}

/// Seconds since the Unix epoch, matching the teacher's own
/// `db_sqlite.rs` timestamp convention for vault node create/modify times.
#[allow(clippy::cast_possible_truncation)]
pub fn now_unix() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as u32
}

/// Storage abstraction shared by the sqlite and in-memory backends.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Inserts a brand-new client record. Fails if the name is already taken
    /// (spec §3 invariant: names are unique).
    async fn register(&self, name: &str) -> Result<ClientRecord>;

    /// Looks up a client by its server-issued identifier.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ClientRecord>>;

    /// Looks up a client by name, case-insensitively (spec §3).
    async fn find_by_name(&self, name: &str) -> Result<Option<ClientRecord>>;

    /// Persists a newly-published public key for an existing client,
    /// overwriting any previously stored key (spec §4.4 `Reconnect` path).
    async fn set_public_key(
        &self,
        id: Uuid,
        public_key: [u8; crate::crypto::PUBLIC_KEY_WIRE_SIZE],
    ) -> Result<()>;

    /// Records a freshly-issued session key and bumps `last_seen` to now
    /// (spec §3: "session key is replaced on every key-exchange").
    async fn record_key_exchange(&self, id: Uuid, session_key: [u8; SESSION_KEY_SIZE]) -> Result<()>;

    /// Records the outcome of a completed upload in the `files` table
    /// (spec §4.6): `storage_path` is set on the packet that finalized the
    /// write, `verified` reflects the client's final 1029/1030/1031 report.
    async fn record_file_outcome(
        &self,
        client_id: Uuid,
        filename: &str,
        storage_path: Option<&str>,
        verified: bool,
    ) -> Result<()>;
}
