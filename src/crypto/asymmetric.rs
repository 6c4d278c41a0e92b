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

//! RSA-1024 keypair used solely to wrap/unwrap the 32-byte AES session key
//! during the `PublishPublicKey` handshake (spec §4.3). The wire encoding of
//! the public key is fixed at 160 bytes: a 128-byte big-endian modulus
//! followed by a 32-byte big-endian public exponent, zero-padded on the
//! left. This is one of this crate's resolved Open Questions (see
//! DESIGN.md) since the source material's own key length varies across
//! branches; 1024-bit keys keep the modulus and ciphertext both fitting in
//! a single generic-payload frame without the fragmentation `SendFile`
//! needs for its own chunking.

use anyhow::{anyhow, Context, Result};
use rand::rngs::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

use crate::crypto::symmetric::{SessionKey, SESSION_KEY_SIZE};

const MODULUS_BYTES: usize = 128;
const EXPONENT_BYTES: usize = 32;

/// Wire size of an encoded [`PublicKey`]: modulus followed by exponent.
pub const PUBLIC_KEY_WIRE_SIZE: usize = MODULUS_BYTES + EXPONENT_BYTES;

/// Wire size of an RSA-wrapped ciphertext: one block, equal to the modulus size.
pub const CIPHERTEXT_WIRE_SIZE: usize = MODULUS_BYTES;

/// A client's long-lived RSA keypair, generated once at first registration
/// and persisted locally thereafter (spec §6 / SPEC_FULL §2).
pub struct PrivateKey {
    inner: RsaPrivateKey,
}

/// The public half, as sent over the wire in a `PublishPublicKey` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    inner: RsaPublicKey,
}

impl PrivateKey {
    /// Generates a fresh 1024-bit keypair.
    pub fn generate() -> Result<Self> {
        let inner =
            RsaPrivateKey::new(&mut OsRng, MODULUS_BYTES * 8).context("generating RSA keypair")?;
        Ok(Self { inner })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey { inner: RsaPublicKey::from(&self.inner) }
    }

    /// Unwraps a session key previously wrapped with [`PublicKey::wrap_session_key`].
    pub fn unwrap_session_key(&self, ciphertext: &[u8]) -> Result<SessionKey> {
        if ciphertext.len() != CIPHERTEXT_WIRE_SIZE {
            return Err(anyhow!(
                "ciphertext is {} bytes, expected {}",
                ciphertext.len(),
                CIPHERTEXT_WIRE_SIZE
            ));
        }
        let plain = self
            .inner
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|err| anyhow!("RSA unwrap failed: {err}"))?;
        SessionKey::from_bytes(&plain)
    }

    /// Encodes the private key's modulus and private exponent as raw
    /// big-endian bytes for atomic persistence to the client's local
    /// identity file. Primes are not separately stored; they are
    /// regenerated implicitly by `rsa` from `d`, `n`, and `e` on load is
    /// not supported, so the full `RsaPrivateKey` is serialized via PKCS#1.
    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>> {
        use rsa::pkcs1::EncodeRsaPrivateKey;
        self.inner
            .to_pkcs1_der()
            .map(|doc| doc.as_bytes().to_vec())
            .context("encoding RSA private key")
    }

    pub fn from_pkcs1_der(bytes: &[u8]) -> Result<Self> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        let inner = RsaPrivateKey::from_pkcs1_der(bytes).context("decoding RSA private key")?;
        Ok(Self { inner })
    }
}

impl PublicKey {
    /// Encodes this key into the fixed 160-byte wire form.
    pub fn to_wire_bytes(&self) -> [u8; PUBLIC_KEY_WIRE_SIZE] {
        let mut buf = [0u8; PUBLIC_KEY_WIRE_SIZE];
        let n = self.inner.n().to_bytes_be();
        let e = self.inner.e().to_bytes_be();
        copy_right_aligned(&mut buf[..MODULUS_BYTES], &n);
        copy_right_aligned(&mut buf[MODULUS_BYTES..], &e);
        buf
    }

    /// Decodes a public key from its fixed 160-byte wire form.
    pub fn from_wire_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != PUBLIC_KEY_WIRE_SIZE {
            return Err(anyhow!(
                "public key is {} bytes, expected {}",
                buf.len(),
                PUBLIC_KEY_WIRE_SIZE
            ));
        }
        let n = BigUint::from_bytes_be(&buf[..MODULUS_BYTES]);
        let e = BigUint::from_bytes_be(&buf[MODULUS_BYTES..]);
        let inner = RsaPublicKey::new(n, e).map_err(|err| anyhow!("invalid public key: {err}"))?;
        Ok(Self { inner })
    }

    /// Wraps a session key for transmission, producing a fixed 128-byte ciphertext.
    pub fn wrap_session_key(&self, key: &SessionKey) -> Result<Vec<u8>> {
        let ciphertext = self
            .inner
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, key.as_bytes())
            .map_err(|err| anyhow!("RSA wrap failed: {err}"))?;
        if ciphertext.len() != CIPHERTEXT_WIRE_SIZE {
            return Err(anyhow!(
                "unexpected ciphertext length {} (expected {})",
                ciphertext.len(),
                CIPHERTEXT_WIRE_SIZE
            ));
        }
        Ok(ciphertext)
    }
}

/// Copies `src` into `dst` so that `src` is right-aligned (big-endian
/// zero-padding on the left); `src` must not be longer than `dst`.
fn copy_right_aligned(dst: &mut [u8], src: &[u8]) {
    assert!(src.len() <= dst.len());
    let offset = dst.len() - src.len();
    dst[offset..].copy_from_slice(src);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_wire_round_trips() {
        let private = PrivateKey::generate().unwrap();
        let public = private.public_key();
        let wire = public.to_wire_bytes();
        assert_eq!(wire.len(), PUBLIC_KEY_WIRE_SIZE);
        let decoded = PublicKey::from_wire_bytes(&wire).unwrap();
        assert_eq!(decoded, public);
    }

    #[test]
    fn session_key_wraps_and_unwraps() {
        let private = PrivateKey::generate().unwrap();
        let public = private.public_key();
        let key = SessionKey::generate();
        let wrapped = public.wrap_session_key(&key).unwrap();
        assert_eq!(wrapped.len(), CIPHERTEXT_WIRE_SIZE);
        let unwrapped = private.unwrap_session_key(&wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let private = PrivateKey::generate().unwrap();
        assert!(private.unwrap_session_key(&[0u8; SESSION_KEY_SIZE]).is_err());
    }

    #[test]
    fn private_key_der_round_trips() {
        let private = PrivateKey::generate().unwrap();
        let der = private.to_pkcs1_der().unwrap();
        let reloaded = PrivateKey::from_pkcs1_der(&der).unwrap();
        assert_eq!(reloaded.public_key(), private.public_key());
    }
}
