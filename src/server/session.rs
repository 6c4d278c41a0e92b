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

//! Per-connection state: one [`ActiveSession`] per TCP connection, holding
//! the client's current session key and any in-flight [`PendingFile`]
//! uploads (spec §3). Neither type is shared across workers; a connection
//! owns its session outright and drops it on disconnect.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use uuid::Uuid;

use crate::crypto::SessionKey;

/// An in-flight upload for one filename, accumulating ciphertext packets
/// in strict index order.
pub struct PendingFile {
    pub filename: String,
    pub declared_original_size: u32,
    pub declared_encrypted_size: u32,
    pub total_packets: u16,
    pub next_expected_index: u16,
    pub buffer: Vec<u8>,
}

impl PendingFile {
    pub fn new(
        filename: String,
        declared_original_size: u32,
        declared_encrypted_size: u32,
        total_packets: u16,
    ) -> Self {
        Self {
            filename,
            declared_original_size,
            declared_encrypted_size,
            total_packets,
            next_expected_index: 1,
            buffer: Vec::with_capacity(declared_encrypted_size as usize),
        }
    }

    /// Appends one packet's ciphertext chunk, enforcing strict-order,
    /// no-duplicate, no-overrun semantics (spec §3 invariant).
    pub fn append_packet(&mut self, index: u16, total: u16, chunk: &[u8]) -> Result<()> {
        if total != self.total_packets {
            return Err(anyhow!(
                "packet declares total_packets={total}, expected {}",
                self.total_packets
            ));
        }
        if index != self.next_expected_index {
            return Err(anyhow!(
                "packet index {index} out of order, expected {}",
                self.next_expected_index
            ));
        }
        if self.buffer.len() + chunk.len() > self.declared_encrypted_size as usize {
            return Err(anyhow!(
                "accumulated bytes {} + {} would exceed declared encrypted size {}",
                self.buffer.len(),
                chunk.len(),
                self.declared_encrypted_size
            ));
        }
        self.buffer.extend_from_slice(chunk);
        self.next_expected_index += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.next_expected_index > self.total_packets
    }
}

/// Transient per-connection session, torn down when the socket closes.
pub struct ActiveSession {
    pub client_id: Uuid,
    pub session_key: SessionKey,
    pending: HashMap<String, PendingFile>,
}

impl ActiveSession {
    pub fn new(client_id: Uuid, session_key: SessionKey) -> Self {
        Self { client_id, session_key, pending: HashMap::new() }
    }

    /// Returns the pending upload for `filename`, creating (and replacing
    /// any prior one, per the spec's start-over semantics) it if `index == 1`.
    pub fn pending_for_packet(
        &mut self,
        filename: &str,
        index: u16,
        total: u16,
        declared_original_size: u32,
        declared_encrypted_size: u32,
    ) -> Result<&mut PendingFile> {
        if index == 1 {
            self.pending.insert(
                filename.to_string(),
                PendingFile::new(
                    filename.to_string(),
                    declared_original_size,
                    declared_encrypted_size,
                    total,
                ),
            );
        }
        self.pending
            .get_mut(filename)
            .ok_or_else(|| anyhow!("no pending upload for '{filename}' (first packet missing)"))
    }

    pub fn discard_pending(&mut self, filename: &str) {
        self.pending.remove(filename);
    }

    pub fn take_completed(&mut self, filename: &str) -> Option<PendingFile> {
        if self.pending.get(filename).is_some_and(PendingFile::is_complete) {
            self.pending.remove(filename)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_packet_in_order_accumulates() {
        let mut pending = PendingFile::new("x.bin".to_string(), 6, 16, 2);
        pending.append_packet(1, 2, &[1u8; 8]).unwrap();
        pending.append_packet(2, 2, &[2u8; 8]).unwrap();
        assert!(pending.is_complete());
        assert_eq!(pending.buffer.len(), 16);
    }

    #[test]
    fn append_packet_out_of_order_fails() {
        let mut pending = PendingFile::new("x.bin".to_string(), 6, 16, 2);
        assert!(pending.append_packet(2, 2, &[1u8; 8]).is_err());
    }

    #[test]
    fn append_packet_overrun_fails() {
        let mut pending = PendingFile::new("x.bin".to_string(), 1, 4, 1);
        assert!(pending.append_packet(1, 1, &[0u8; 5]).is_err());
    }

    #[test]
    fn fresh_first_packet_replaces_prior_pending() {
        let mut session = ActiveSession::new(Uuid::nil(), crate::crypto::SessionKey::generate());
        {
            let pending = session
                .pending_for_packet("a.txt", 1, 2, 6, 16)
                .unwrap();
            pending.append_packet(1, 2, &[0u8; 8]).unwrap();
        }
        // Re-starting with a fresh index-1 packet discards the half-finished transfer.
        let pending = session.pending_for_packet("a.txt", 1, 1, 6, 8).unwrap();
        assert_eq!(pending.buffer.len(), 0);
        assert_eq!(pending.total_packets, 1);
    }
}
