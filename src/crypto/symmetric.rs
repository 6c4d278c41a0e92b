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

//! AES-256-CBC symmetric cipher for file payloads. The IV is fixed at all
//! zero bytes per spec §4.3/§9: this is a deliberate, explicit protocol
//! property of the system being modeled, not an oversight, and must never
//! be randomized by an implementation of this crate.

use aes::Aes256;
use anyhow::{anyhow, Result};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

pub const SESSION_KEY_SIZE: usize = 32;
const BLOCK_SIZE: usize = 16;
const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

/// A 32-byte AES-256 session key, generated fresh by the client for every
/// registration/reconnect handshake and wrapped in transit with RSA.
#[derive(Clone)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        rand::rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SESSION_KEY_SIZE {
            return Err(anyhow!(
                "session key is {} bytes, expected {}",
                bytes.len(),
                SESSION_KEY_SIZE
            ));
        }
        let mut buf = [0u8; SESSION_KEY_SIZE];
        buf.copy_from_slice(bytes);
        Ok(Self { bytes: buf })
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.bytes
    }

    /// Encrypts `plaintext` with AES-256-CBC, PKCS7 padding, zero IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Encryptor::new(self.bytes.as_slice().into(), &ZERO_IV.into())
            .encrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(plaintext)
    }

    /// Decrypts a ciphertext produced by [`SessionKey::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(anyhow!(
                "ciphertext length {} is not a nonzero multiple of the block size",
                ciphertext.len()
            ));
        }
        Decryptor::new(self.bytes.as_slice().into(), &ZERO_IV.into())
            .decrypt_padded_vec_mut::<cbc::cipher::block_padding::Pkcs7>(ciphertext)
            .map_err(|err| anyhow!("AES decrypt/unpad failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_length_plaintext() {
        let key = SessionKey::generate();
        for len in [0usize, 1, 15, 16, 17, 1000] {
            let plaintext = vec![0xab; len];
            let ciphertext = key.encrypt(&plaintext);
            assert_eq!(ciphertext.len() % BLOCK_SIZE, 0);
            let decrypted = key.decrypt(&ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn same_plaintext_same_key_is_deterministic() {
        let key = SessionKey::from_bytes(&[9u8; SESSION_KEY_SIZE]).unwrap();
        let a = key.encrypt(b"same input every time");
        let b = key.encrypt(b"same input every time");
        assert_eq!(a, b, "fixed zero IV must make encryption deterministic");
    }

    #[test]
    fn rejects_malformed_key_length() {
        assert!(SessionKey::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn rejects_non_block_aligned_ciphertext() {
        let key = SessionKey::generate();
        assert!(key.decrypt(&[1, 2, 3]).is_err());
    }
}
