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

//! The client's persisted local identity: name, server-issued identifier,
//! and private key, stored in a text-friendly encoding and written
//! atomically (spec §6), the same create-if-absent shape as the teacher's
//! `config::load_or_create_ntd_key`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use data_encoding::HEXLOWER;
use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::crypto::asymmetric::PrivateKey;

/// `name\nidentifier-hex\nprivate-key-base64\n`
pub struct ClientIdentity {
    pub name: String,
    pub id: Uuid,
    pub private_key: PrivateKey,
}

impl ClientIdentity {
    /// Loads a previously-persisted identity, if `path` exists.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };

        let mut lines = text.lines();
        let name = lines.next().ok_or_else(|| anyhow!("identity file missing name line"))?;
        let id_hex = lines.next().ok_or_else(|| anyhow!("identity file missing identifier line"))?;
        let key_b64 = lines.next().ok_or_else(|| anyhow!("identity file missing key line"))?;

        let id_bytes = HEXLOWER
            .decode(id_hex.as_bytes())
            .map_err(|err| anyhow!("corrupt identifier in identity file: {err}"))?;
        let id = Uuid::from_slice(&id_bytes).map_err(|err| anyhow!("malformed identifier: {err}"))?;

        let key_der = BASE64
            .decode(key_b64)
            .map_err(|err| anyhow!("corrupt private key in identity file: {err}"))?;
        let private_key = PrivateKey::from_pkcs1_der(&key_der)?;

        Ok(Some(Self { name: name.to_string(), id, private_key }))
    }

    /// Atomically persists this identity: write a temp file in the same
    /// directory, then rename over the destination.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;

        let id_hex = HEXLOWER.encode(self.id.as_bytes());
        let key_der = self.private_key.to_pkcs1_der()?;
        let key_b64 = BASE64.encode(key_der);

        let mut tmp = NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{}", self.name)?;
        writeln!(tmp, "{id_hex}")?;
        writeln!(tmp, "{key_b64}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| anyhow!("failed to finalize identity file: {err}"))?;
        Ok(())
    }
}

pub fn default_identity_path() -> PathBuf {
    PathBuf::from(".cryptobak_identity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_identity_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        assert!(ClientIdentity::load(&path).unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        let private_key = PrivateKey::generate().unwrap();
        let identity = ClientIdentity { name: "alice".to_string(), id: Uuid::new_v4(), private_key };

        identity.save(&path).unwrap();
        let reloaded = ClientIdentity::load(&path).unwrap().unwrap();

        assert_eq!(reloaded.name, "alice");
        assert_eq!(reloaded.id, identity.id);
        assert_eq!(reloaded.private_key.public_key(), identity.private_key.public_key());
    }
}
