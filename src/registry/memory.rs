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

//! In-memory client registry backend, used by tests and by anyone who
//! doesn't need records to survive a restart.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use unicase::UniCase;
use uuid::Uuid;

use super::{now_unix, ClientRecord, ClientRegistry};
use crate::wire::SESSION_KEY_SIZE;

#[derive(Clone, Debug, PartialEq, Eq)]
struct FileRecord {
    storage_path: Option<String>,
    verified: bool,
}

#[derive(Default)]
struct Backend {
    by_id: HashMap<Uuid, ClientRecord>,
    names: HashMap<UniCase<String>, Uuid>,
    files: HashMap<(Uuid, String), FileRecord>,
}

/// A `ClientRegistry` backed by plain in-process hash maps.
pub struct MemoryRegistry {
    inner: Mutex<Backend>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Backend::default()) }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClientRegistry for MemoryRegistry {
    async fn register(&self, name: &str) -> Result<ClientRecord> {
        let mut backend = self.inner.lock().unwrap();
        let key = UniCase::new(name.to_string());
        if backend.names.contains_key(&key) {
            return Err(anyhow!("client name '{name}' is already registered"));
        }
        let record = ClientRecord::new(Uuid::new_v4(), name, now_unix());
        backend.names.insert(key, record.id);
        backend.by_id.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ClientRecord>> {
        Ok(self.inner.lock().unwrap().by_id.get(&id).cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ClientRecord>> {
        let backend = self.inner.lock().unwrap();
        let key = UniCase::new(name.to_string());
        Ok(backend.names.get(&key).and_then(|id| backend.by_id.get(id)).cloned())
    }

    async fn set_public_key(
        &self,
        id: Uuid,
        public_key: [u8; crate::crypto::PUBLIC_KEY_WIRE_SIZE],
    ) -> Result<()> {
        let mut backend = self.inner.lock().unwrap();
        let record = backend
            .by_id
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no such client {id}"))?;
        record.public_key = Some(public_key);
        Ok(())
    }

    async fn record_key_exchange(&self, id: Uuid, session_key: [u8; SESSION_KEY_SIZE]) -> Result<()> {
        let mut backend = self.inner.lock().unwrap();
        let record = backend
            .by_id
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no such client {id}"))?;
        record.session_key = Some(session_key);
        record.last_seen = now_unix();
        Ok(())
    }

    async fn record_file_outcome(
        &self,
        client_id: Uuid,
        filename: &str,
        storage_path: Option<&str>,
        verified: bool,
    ) -> Result<()> {
        let mut backend = self.inner.lock().unwrap();
        let key = (client_id, filename.to_string());
        let entry = backend.files.entry(key).or_insert(FileRecord { storage_path: None, verified: false });
        if let Some(path) = storage_path {
            entry.storage_path = Some(path.to_string());
        }
        entry.verified = verified;
        Ok(())
    }
}
