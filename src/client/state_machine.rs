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

//! The client's transfer state machine (spec §4.4): strictly sequential,
//! no parallelism within one transfer. `transfer_file` drives a single
//! upload through as many attempts as the CRC-retry budget allows.

use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use log::{info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::client::identity::ClientIdentity;
use crate::config::ClientConfig;
use crate::crypto::cksum::cksum;
use crate::crypto::symmetric::SessionKey;
use crate::error::{kind_of, ErrorKind};
use crate::proto_error;
use crate::wire::{
    decode_name, encode_name, FilePacketHeader, RequestCode, RequestHeader, ResponseCode,
    ResponseHeader, IDENTIFIER_SIZE, MAX_PACKETS_PER_FILE, NAME_FIELD_SIZE, NULL_CLIENT_ID,
    PROTOCOL_VERSION,
};

/// Upper bound on a single `SendFile` chunk, per the wire constants table
/// (64 KiB..1 MiB). 1 MiB matches the original system's own chunk size.
pub const MAX_CHUNK: usize = 1024 * 1024;

const MAX_ATTEMPTS: u32 = 3;

/// The single structured outcome the state machine reports to its caller
/// (spec §7 "Propagation policy"): success, retriable-failed never escapes
/// this module, and permanent-failed carries the reason.
#[derive(Debug)]
pub enum TransferOutcome {
    Done,
    PermanentFailure(String),
}

async fn send_request(
    stream: &mut TcpStream,
    client_id: Uuid,
    code: RequestCode,
    payload: &[u8],
) -> Result<()> {
    let header = RequestHeader {
        client_id,
        version: PROTOCOL_VERSION,
        code: code as u16,
        payload_len: payload.len() as u32,
    };
    let mut buf = Cursor::new(Vec::with_capacity(23 + payload.len()));
    header.write(&mut buf)?;
    use std::io::Write;
    buf.write_all(payload)?;
    stream
        .write_all(buf.get_ref())
        .await
        .map_err(|err| proto_error!(ErrorKind::Network, "writing request: {err}"))?;
    Ok(())
}

async fn read_response(stream: &mut TcpStream) -> Result<(ResponseHeader, Vec<u8>)> {
    let header = ResponseHeader::read(stream)
        .await
        .map_err(|err| proto_error!(ErrorKind::Network, "reading response header: {err}"))?;
    let mut payload = vec![0u8; header.payload_len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|err| proto_error!(ErrorKind::Network, "reading response payload: {err}"))?;
    Ok((header, payload))
}

/// `Configured -> Identified -> KeyExchanged`: registers or reconnects,
/// exchanges keys, and returns the negotiated client id and session key.
async fn identify_and_exchange_keys(
    stream: &mut TcpStream,
    identity: &mut Option<ClientIdentity>,
    name: &str,
) -> Result<(Uuid, SessionKey)> {
    if let Some(existing) = identity.as_ref() {
        send_request(stream, existing.id, RequestCode::Reconnect, &encode_name(&existing.name)?)
            .await?;
        let (header, payload) = read_response(stream).await?;
        match resolve_response_code(header.code)? {
            ResponseCode::PublicKeyAcceptedWithSessionKey => {
                let (id, session_key) =
                    decode_key_exchange_payload(&payload, &existing.private_key)?;
                return Ok((id, session_key));
            }
            ResponseCode::UnknownClientOrCode => {
                info!("server does not recognize this identity, falling back to registration");
            }
            other => return Err(anyhow!("unexpected response {other:?} to Reconnect")),
        }
    }

    send_request(stream, NULL_CLIENT_ID, RequestCode::Register, &encode_name(name)?).await?;
    let (header, payload) = read_response(stream).await?;
    match resolve_response_code(header.code)? {
        ResponseCode::RegistrationSuccess => {
            let id = Uuid::from_slice(&payload)
                .map_err(|err| anyhow!("malformed identifier in RegistrationSuccess: {err}"))?;
            let private_key = crate::crypto::asymmetric::PrivateKey::generate()?;
            *identity = Some(ClientIdentity { name: name.to_string(), id, private_key });
        }
        ResponseCode::RegistrationFailed => {
            return Err(anyhow!("registration rejected, name '{name}' may already be taken"));
        }
        other => return Err(anyhow!("unexpected response {other:?} to Register")),
    }

    let identity_ref = identity.as_ref().expect("just assigned above");
    let public_key = identity_ref.private_key.public_key();
    let mut payload = encode_name(name)?.to_vec();
    payload.extend_from_slice(&public_key.to_wire_bytes());
    send_request(stream, identity_ref.id, RequestCode::PublishPublicKey, &payload).await?;

    let (header, payload) = read_response(stream).await?;
    match resolve_response_code(header.code)? {
        ResponseCode::PublicKeyAcceptedWithSessionKey => {
            decode_key_exchange_payload(&payload, &identity_ref.private_key)
        }
        other => Err(anyhow!("unexpected response {other:?} to PublishPublicKey")),
    }
}

fn decode_key_exchange_payload(
    payload: &[u8],
    private_key: &crate::crypto::asymmetric::PrivateKey,
) -> Result<(Uuid, SessionKey)> {
    if payload.len() <= IDENTIFIER_SIZE {
        return Err(anyhow!("key-exchange payload too short"));
    }
    let id = Uuid::from_slice(&payload[..IDENTIFIER_SIZE])
        .map_err(|err| anyhow!("malformed identifier in key-exchange payload: {err}"))?;
    let session_key = private_key.unwrap_session_key(&payload[IDENTIFIER_SIZE..])?;
    Ok((id, session_key))
}

fn resolve_response_code(code: u16) -> Result<ResponseCode> {
    use num_traits::FromPrimitive;
    ResponseCode::from_u16(code).ok_or_else(|| anyhow!("unknown response code {code}"))
}

/// `KeyExchanged -> Uploading -> AwaitingCrc`: encrypts the whole file once,
/// splits the ciphertext into at most `MAX_PACKETS_PER_FILE` chunks, and
/// uploads them in order. Returns the server-reported CRC from the final
/// `FileReceivedWithCrc` response.
async fn upload_file(
    stream: &mut TcpStream,
    client_id: Uuid,
    session_key: &SessionKey,
    filename: &str,
    plaintext: &[u8],
) -> Result<u32> {
    let ciphertext = session_key.encrypt(plaintext);
    let total_packets = ciphertext.len().div_ceil(MAX_CHUNK).max(1);
    if total_packets > MAX_PACKETS_PER_FILE as usize {
        return Err(proto_error!(
            ErrorKind::Protocol,
            "file requires {total_packets} packets, exceeds the {MAX_PACKETS_PER_FILE}-packet limit"
        ));
    }

    for (index, chunk) in ciphertext.chunks(MAX_CHUNK.max(1)).enumerate() {
        let packet_header = FilePacketHeader {
            encrypted_size: ciphertext.len() as u32,
            original_size: plaintext.len() as u32,
            packet_index: (index + 1) as u16,
            total_packets: total_packets as u16,
            filename: filename.to_string(),
        };
        let mut payload = Vec::with_capacity(FilePacketHeader::WIRE_SIZE + chunk.len());
        packet_header.write(&mut payload)?;
        payload.extend_from_slice(chunk);
        send_request(stream, client_id, RequestCode::SendFile, &payload).await?;
    }

    let (header, payload) = read_response(stream).await?;
    match resolve_response_code(header.code)? {
        ResponseCode::FileReceivedWithCrc => {
            if payload.len() < IDENTIFIER_SIZE + 4 + NAME_FIELD_SIZE + 4 {
                return Err(anyhow!("FileReceivedWithCrc payload too short"));
            }
            let crc_offset = IDENTIFIER_SIZE + 4 + NAME_FIELD_SIZE;
            let mut crc_bytes = Cursor::new(&payload[crc_offset..crc_offset + 4]);
            Ok(crc_bytes.read_u32::<LittleEndian>()?)
        }
        other => Err(anyhow!("unexpected response {other:?} after final SendFile packet")),
    }
}

async fn report_crc(stream: &mut TcpStream, client_id: Uuid, code: RequestCode, filename: &str) -> Result<()> {
    send_request(stream, client_id, code, &encode_name(filename)?).await?;
    let (header, _payload) = read_response(stream).await?;
    match resolve_response_code(header.code)? {
        ResponseCode::GenericAck => Ok(()),
        other => Err(anyhow!("unexpected response {other:?} to CRC report")),
    }
}

/// The result of one connect/identify/upload/verify round (see
/// [`attempt_once`]). `Retriable` and `Fatal` both carry the error that
/// ended the attempt; only `Retriable` counts against the retry budget the
/// same way a CRC mismatch does.
enum AttemptOutcome {
    Verified,
    Mismatch,
    Retriable(anyhow::Error),
    Fatal(anyhow::Error),
}

/// Runs the full transfer for `config`, persisting/loading local identity
/// at `identity_path`, up to the 3-attempt CRC-retry budget.
pub async fn transfer_file(config: &ClientConfig, identity_path: &Path) -> Result<TransferOutcome> {
    let plaintext = std::fs::read(&config.file_path)
        .with_context(|| format!("reading {}", config.file_path.display()))?;
    let filename = config
        .file_path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("upload path has no valid filename"))?
        .to_string();

    let mut identity = ClientIdentity::load(identity_path)?;
    let expected_crc = cksum(&plaintext);

    for attempt in 1..=MAX_ATTEMPTS {
        let is_final_attempt = attempt == MAX_ATTEMPTS;
        let outcome = attempt_once(
            config,
            &mut identity,
            &filename,
            &plaintext,
            expected_crc,
            is_final_attempt,
        )
        .await;
        if let Some(ref identity) = identity {
            identity.save(identity_path)?;
        }

        match outcome {
            AttemptOutcome::Verified => return Ok(TransferOutcome::Done),
            AttemptOutcome::Mismatch if !is_final_attempt => {
                warn!("CRC mismatch on attempt {attempt}, retrying");
                continue;
            }
            AttemptOutcome::Mismatch => {
                return Ok(TransferOutcome::PermanentFailure(format!(
                    "CRC mismatch persisted across {MAX_ATTEMPTS} attempts"
                )));
            }
            AttemptOutcome::Retriable(err) if !is_final_attempt => {
                warn!("network error on attempt {attempt}, retrying: {err}");
                continue;
            }
            AttemptOutcome::Retriable(err) => {
                return Ok(TransferOutcome::PermanentFailure(format!(
                    "network error persisted across {MAX_ATTEMPTS} attempts: {err}"
                )));
            }
            AttemptOutcome::Fatal(err) => {
                return Ok(TransferOutcome::PermanentFailure(err.to_string()));
            }
        }
    }
    unreachable!("loop always returns within MAX_ATTEMPTS iterations")
}

/// One full connect/identify/upload/verify round. A failure to connect or
/// to complete the identify/key-exchange handshake is always
/// [`AttemptOutcome::Fatal`] (spec §7: a `NetworkError` is fatal "otherwise",
/// i.e. outside of a mid-upload transfer); once the session key is in hand,
/// a `NetworkError` during upload or CRC reporting is mid-upload and counts
/// against the retry budget instead ([`AttemptOutcome::Retriable`]).
async fn attempt_once(
    config: &ClientConfig,
    identity: &mut Option<ClientIdentity>,
    filename: &str,
    plaintext: &[u8],
    expected_crc: u32,
    is_final_attempt: bool,
) -> AttemptOutcome {
    let mut stream = match TcpStream::connect(config.server_addr).await {
        Ok(stream) => stream,
        Err(err) => {
            return AttemptOutcome::Fatal(proto_error!(
                ErrorKind::Network,
                "connecting to {}: {err}",
                config.server_addr
            ))
        }
    };

    let (client_id, session_key) =
        match identify_and_exchange_keys(&mut stream, identity, &config.name).await {
            Ok(pair) => pair,
            Err(err) => return AttemptOutcome::Fatal(err),
        };

    match upload_and_verify(
        &mut stream,
        client_id,
        &session_key,
        filename,
        plaintext,
        expected_crc,
        is_final_attempt,
    )
    .await
    {
        Ok(true) => AttemptOutcome::Verified,
        Ok(false) => AttemptOutcome::Mismatch,
        Err(err) if kind_of(&err) == Some(ErrorKind::Network) => AttemptOutcome::Retriable(err),
        Err(err) => AttemptOutcome::Fatal(err),
    }
}

/// `KeyExchanged -> Uploading -> AwaitingCrc -> VerifyingCrc`: uploads the
/// file and reports the CRC outcome. Returns `Ok(true)` on a verified match,
/// `Ok(false)` on a CRC mismatch (client should retry, unless
/// `is_final_attempt`, in which case the mismatch is reported as
/// `CrcFailed` rather than `CrcRetry`, per spec §4.4).
async fn upload_and_verify(
    stream: &mut TcpStream,
    client_id: Uuid,
    session_key: &SessionKey,
    filename: &str,
    plaintext: &[u8],
    expected_crc: u32,
    is_final_attempt: bool,
) -> Result<bool> {
    let server_crc = upload_file(stream, client_id, session_key, filename, plaintext).await?;

    if server_crc == expected_crc {
        report_crc(stream, client_id, RequestCode::CrcOk, filename).await?;
        Ok(true)
    } else {
        let report_code = if is_final_attempt { RequestCode::CrcFailed } else { RequestCode::CrcRetry };
        report_crc(stream, client_id, report_code, filename).await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_chunk_is_within_wire_bounds() {
        assert!(MAX_CHUNK >= 64 * 1024);
        assert!(MAX_CHUNK <= 1024 * 1024);
    }
}
