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

//! Cryptographic adapters: the client's RSA keypair used to wrap a session
//! key, the AES-256-CBC symmetric cipher used for file payloads, and the
//! POSIX `cksum` checksum used for end-to-end integrity verification.

pub mod asymmetric;
pub mod cksum;
pub mod symmetric;

pub use asymmetric::{PublicKey, PrivateKey, PUBLIC_KEY_WIRE_SIZE, CIPHERTEXT_WIRE_SIZE};
pub use symmetric::SessionKey;
