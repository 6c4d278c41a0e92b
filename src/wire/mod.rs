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

//! Binary wire framing: request/response headers, the name field, and the
//! per-packet file header. Little-endian throughout, per the wire
//! constants table. Every decode here validates declared sizes against a
//! fixed ceiling before the caller allocates or reads further.

pub mod codes;

use std::fmt;
use std::io::Write;

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use num_traits::FromPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

pub use codes::{RequestCode, ResponseCode};

pub const PROTOCOL_VERSION: u8 = 3;

pub const REQUEST_HEADER_SIZE: usize = 23;
pub const RESPONSE_HEADER_SIZE: usize = 7;

pub const IDENTIFIER_SIZE: usize = 16;
pub const NAME_FIELD_SIZE: usize = 255;
pub const SESSION_KEY_SIZE: usize = 32;

pub const DEFAULT_TCP_PORT: u16 = 1256;
pub const MAX_PACKETS_PER_FILE: u16 = 65535;

/// Declared-payload ceilings (spec §7): the primary defense against
/// memory-exhaustion attacks carried in an attacker-controlled length field.
pub const MAX_FILE_PAYLOAD: u32 = 16 * 1024 * 1024;
pub const MAX_GENERIC_PAYLOAD: u32 = 4 * 1024;

pub const NULL_CLIENT_ID: Uuid = Uuid::nil();

/// A decoded 23-byte request header (the payload, if any, follows separately).
#[derive(Copy, Clone, Debug)]
pub struct RequestHeader {
    pub client_id: Uuid,
    pub version: u8,
    pub code: u16,
    pub payload_len: u32,
}

impl RequestHeader {
    pub async fn read<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let mut id_buf = [0u8; IDENTIFIER_SIZE];
        stream.read_exact(&mut id_buf).await?;
        let client_id = Uuid::from_bytes(id_buf);
        let version = stream.read_u8().await?;
        let code = stream.read_u16_le().await?;
        let payload_len = stream.read_u32_le().await?;
        Ok(Self { client_id, version, code, payload_len })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(self.client_id.as_bytes())?;
        stream.write_u8(self.version)?;
        stream.write_u16::<LittleEndian>(self.code)?;
        stream.write_u32::<LittleEndian>(self.payload_len)?;
        Ok(())
    }

    /// Validates the version, resolves the numeric code to a known
    /// [`RequestCode`], and checks the declared payload length against that
    /// code's ceiling (`MAX_FILE_PAYLOAD` for `SendFile`, `MAX_GENERIC_PAYLOAD`
    /// otherwise — spec §7). This is the single source of truth for header
    /// validation; callers must not re-implement these checks inline.
    pub fn validated_code(&self) -> Result<RequestCode, HeaderValidationError> {
        if self.version != PROTOCOL_VERSION {
            return Err(HeaderValidationError::UnsupportedVersion {
                got: self.version,
                expected: PROTOCOL_VERSION,
            });
        }
        let code = RequestCode::from_u16(self.code)
            .ok_or(HeaderValidationError::UnknownCode(self.code))?;
        let ceiling = if code == RequestCode::SendFile { MAX_FILE_PAYLOAD } else { MAX_GENERIC_PAYLOAD };
        if self.payload_len > ceiling {
            return Err(HeaderValidationError::PayloadTooLarge { declared: self.payload_len, ceiling });
        }
        Ok(code)
    }
}

/// Why a request header failed validation (spec §7 `ProtocolError`).
/// Distinguished from a plain `anyhow::Error` so callers can pick the
/// right protocol-failure response code for each case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderValidationError {
    UnsupportedVersion { got: u8, expected: u8 },
    UnknownCode(u16),
    PayloadTooLarge { declared: u32, ceiling: u32 },
}

impl fmt::Display for HeaderValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion { got, expected } => {
                write!(f, "unsupported protocol version {got} (expected {expected})")
            }
            Self::UnknownCode(code) => write!(f, "unknown request code {code}"),
            Self::PayloadTooLarge { declared, ceiling } => {
                write!(f, "declared payload {declared} exceeds ceiling {ceiling}")
            }
        }
    }
}

impl std::error::Error for HeaderValidationError {}

/// A decoded 7-byte response header.
#[derive(Copy, Clone, Debug)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u16,
    pub payload_len: u32,
}

impl ResponseHeader {
    pub async fn read<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let version = stream.read_u8().await?;
        let code = stream.read_u16_le().await?;
        let payload_len = stream.read_u32_le().await?;
        Ok(Self { version, code, payload_len })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_u8(self.version)?;
        stream.write_u16::<LittleEndian>(self.code)?;
        stream.write_u32::<LittleEndian>(self.payload_len)?;
        Ok(())
    }

    pub fn for_code(code: ResponseCode, payload_len: u32) -> Self {
        Self { version: PROTOCOL_VERSION, code: code as u16, payload_len }
    }
}

/// Encodes a name into the fixed 255-byte null-terminated, zero-padded field.
/// Names exceeding 254 useful bytes are rejected (spec §4.1).
pub fn encode_name(name: &str) -> Result<[u8; NAME_FIELD_SIZE]> {
    let bytes = name.as_bytes();
    if bytes.len() > NAME_FIELD_SIZE - 1 {
        return Err(anyhow!(
            "name '{}' is {} bytes, exceeds the 254-byte useful limit",
            name,
            bytes.len()
        ));
    }
    let mut buf = [0u8; NAME_FIELD_SIZE];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok(buf)
}

/// Decodes a fixed 255-byte name field, stopping at the first null byte.
pub fn decode_name(buf: &[u8; NAME_FIELD_SIZE]) -> Result<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_SIZE);
    String::from_utf8(buf[..end].to_vec()).map_err(|err| anyhow!("name is not valid UTF-8: {err}"))
}

pub async fn read_name<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; NAME_FIELD_SIZE];
    stream.read_exact(&mut buf).await?;
    decode_name(&buf)
}

pub fn write_name<W: Write>(stream: &mut W, name: &str) -> Result<()> {
    let buf = encode_name(name)?;
    stream.write_all(&buf)?;
    Ok(())
}

/// The per-packet header that prefixes the ciphertext chunk of every
/// `SendFile` request (spec §4.1).
#[derive(Clone, Debug)]
pub struct FilePacketHeader {
    pub encrypted_size: u32,
    pub original_size: u32,
    pub packet_index: u16,
    pub total_packets: u16,
    pub filename: String,
}

impl FilePacketHeader {
    pub const WIRE_SIZE: usize = 4 + 4 + 2 + 2 + NAME_FIELD_SIZE;

    pub async fn read<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let encrypted_size = stream.read_u32_le().await?;
        let original_size = stream.read_u32_le().await?;
        let packet_index = stream.read_u16_le().await?;
        let total_packets = stream.read_u16_le().await?;
        let filename = read_name(stream).await?;
        Ok(Self { encrypted_size, original_size, packet_index, total_packets, filename })
    }

    pub fn write<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_u32::<LittleEndian>(self.encrypted_size)?;
        stream.write_u32::<LittleEndian>(self.original_size)?;
        stream.write_u16::<LittleEndian>(self.packet_index)?;
        stream.write_u16::<LittleEndian>(self.total_packets)?;
        write_name(stream, &self.filename)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_header_round_trips() {
        let header = RequestHeader {
            client_id: Uuid::from_bytes([7; 16]),
            version: PROTOCOL_VERSION,
            code: RequestCode::Register as u16,
            payload_len: 42,
        };
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        assert_eq!(buf.get_ref().len(), REQUEST_HEADER_SIZE);

        let mut read_buf = Cursor::new(buf.into_inner());
        let decoded = RequestHeader::read(&mut read_buf).await.unwrap();
        assert_eq!(decoded.client_id, header.client_id);
        assert_eq!(decoded.version, header.version);
        assert_eq!(decoded.code, header.code);
        assert_eq!(decoded.payload_len, header.payload_len);
    }

    #[test]
    fn response_header_round_trips() {
        let header = ResponseHeader::for_code(ResponseCode::GenericAck, 0);
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        assert_eq!(buf.get_ref().len(), RESPONSE_HEADER_SIZE);
    }

    #[test]
    fn name_round_trips() {
        let encoded = encode_name("backup-client-1").unwrap();
        assert_eq!(encoded.len(), NAME_FIELD_SIZE);
        assert_eq!(decode_name(&encoded).unwrap(), "backup-client-1");
    }

    #[test]
    fn name_rejects_oversized_input() {
        let too_long = "x".repeat(NAME_FIELD_SIZE);
        assert!(encode_name(&too_long).is_err());
        let exactly_254 = "x".repeat(NAME_FIELD_SIZE - 1);
        assert!(encode_name(&exactly_254).is_ok());
    }

    #[test]
    fn request_header_rejects_wrong_version() {
        let header = RequestHeader {
            client_id: Uuid::nil(),
            version: 2,
            code: RequestCode::Register as u16,
            payload_len: 0,
        };
        assert!(matches!(
            header.validated_code(),
            Err(HeaderValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn request_header_rejects_oversized_payload() {
        let header = RequestHeader {
            client_id: Uuid::nil(),
            version: PROTOCOL_VERSION,
            code: RequestCode::SendFile as u16,
            payload_len: MAX_FILE_PAYLOAD + 1,
        };
        assert!(matches!(
            header.validated_code(),
            Err(HeaderValidationError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn request_header_rejects_oversized_generic_payload_under_the_file_ceiling() {
        // A non-SendFile code must be checked against the tighter generic
        // ceiling even though it's well under MAX_FILE_PAYLOAD.
        let header = RequestHeader {
            client_id: Uuid::nil(),
            version: PROTOCOL_VERSION,
            code: RequestCode::Register as u16,
            payload_len: MAX_GENERIC_PAYLOAD + 1,
        };
        assert!(matches!(
            header.validated_code(),
            Err(HeaderValidationError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn request_header_rejects_unknown_code() {
        let header = RequestHeader {
            client_id: Uuid::nil(),
            version: PROTOCOL_VERSION,
            code: 9999,
            payload_len: 0,
        };
        assert!(matches!(header.validated_code(), Err(HeaderValidationError::UnknownCode(9999))));
    }

    #[tokio::test]
    async fn file_packet_header_round_trips() {
        let header = FilePacketHeader {
            encrypted_size: 16,
            original_size: 6,
            packet_index: 1,
            total_packets: 1,
            filename: "hello.txt".to_string(),
        };
        let mut buf = Cursor::new(Vec::new());
        header.write(&mut buf).unwrap();
        assert_eq!(buf.get_ref().len(), FilePacketHeader::WIRE_SIZE);

        let mut read_buf = Cursor::new(buf.into_inner());
        let decoded = FilePacketHeader::read(&mut read_buf).await.unwrap();
        assert_eq!(decoded.encrypted_size, 16);
        assert_eq!(decoded.original_size, 6);
        assert_eq!(decoded.packet_index, 1);
        assert_eq!(decoded.total_packets, 1);
        assert_eq!(decoded.filename, "hello.txt");
    }
}
