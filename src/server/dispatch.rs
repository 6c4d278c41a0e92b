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

//! Per-connection request dispatch: reads one 23-byte header at a time,
//! loads the declared payload, and matches on the request code (spec §4.5).
//! Grounded structurally on the teacher's `auth_srv::server::auth_client`
//! dispatch loop, generalized to this protocol's codes and state machine.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::crypto::asymmetric::PublicKey;
use crate::crypto::cksum::cksum;
use crate::crypto::symmetric::SessionKey;
use crate::error::ErrorKind;
use crate::proto_error;
use crate::server::session::ActiveSession;
use crate::server::storage::{persist_atomically, sanitize_filename};
use crate::server::Server;
use crate::wire::{
    decode_name, encode_name, FilePacketHeader, HeaderValidationError, RequestCode, RequestHeader,
    ResponseCode, ResponseHeader, IDENTIFIER_SIZE, NAME_FIELD_SIZE,
};

/// Drives one TCP connection end to end, until the peer disconnects, an
/// idle timeout fires, or a protocol error terminates the connection.
pub async fn handle_connection(
    server: Arc<Server>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let mut session: Option<ActiveSession> = None;

    loop {
        let header = match tokio::time::timeout(
            server.settings.idle_timeout,
            RequestHeader::read(&mut stream),
        )
        .await
        {
            Ok(Ok(header)) => header,
            Ok(Err(err)) => {
                debug!("{peer}: connection closed: {err}");
                return Ok(());
            }
            Err(_) => {
                debug!("{peer}: idle timeout");
                return Ok(());
            }
        };

        let code = match header.validated_code() {
            Ok(code) => code,
            Err(err @ HeaderValidationError::UnknownCode(_)) => {
                send_response(&mut stream, ResponseCode::UnknownClientOrCode, &[]).await?;
                return Err(proto_error!(ErrorKind::Protocol, "{peer}: {err}"));
            }
            Err(err) => {
                send_response(&mut stream, ResponseCode::MalformedHeader, &[]).await?;
                return Err(proto_error!(ErrorKind::Protocol, "{peer}: {err}"));
            }
        };

        let mut payload = vec![0u8; header.payload_len as usize];
        tokio::time::timeout(server.settings.idle_timeout, stream.read_exact(&mut payload))
            .await
            .map_err(|_| anyhow!("{peer}: idle timeout reading payload"))??;

        let outcome = match code {
            RequestCode::Register => handle_register(&server, &mut stream, &payload).await,
            RequestCode::PublishPublicKey => {
                handle_publish_public_key(&server, &mut stream, header.client_id, &payload, &mut session)
                    .await
            }
            RequestCode::Reconnect => {
                handle_reconnect(&server, &mut stream, header.client_id, &payload, &mut session).await
            }
            RequestCode::SendFile => {
                handle_send_file(&server, &mut stream, header.client_id, &payload, &mut session).await
            }
            RequestCode::CrcOk | RequestCode::CrcRetry | RequestCode::CrcFailed => {
                handle_crc_report(&server, &mut stream, header.client_id, code, &payload, &mut session)
                    .await
            }
        };

        if let Err(err) = outcome {
            warn!("{peer}: terminating connection: {err}");
            return Err(err);
        }
    }
}

async fn send_response(stream: &mut TcpStream, code: ResponseCode, payload: &[u8]) -> Result<()> {
    let header = ResponseHeader::for_code(code, payload.len() as u32);
    let mut buf = Cursor::new(Vec::with_capacity(7 + payload.len()));
    header.write(&mut buf)?;
    use std::io::Write;
    buf.write_all(payload)?;
    stream.write_all(buf.get_ref()).await?;
    Ok(())
}

/// Sends a best-effort protocol-failure response, then surfaces `err` to
/// terminate the connection (spec §7: CryptoError/StorageError/IntegrityError
/// are all terminal, and the server "responds with a protocol failure"
/// where possible before closing).
async fn fail<T>(stream: &mut TcpStream, code: ResponseCode, err: anyhow::Error) -> Result<T> {
    let _ = send_response(stream, code, &[]).await;
    Err(err)
}

async fn handle_register(server: &Server, stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
    let name = decode_name(
        payload
            .try_into()
            .map_err(|_| anyhow!("Register payload is {} bytes, expected {NAME_FIELD_SIZE}", payload.len()))?,
    )?;

    match server.registry.register(&name).await {
        Ok(record) => {
            info!("registered client '{name}' as {}", record.id);
            send_response(stream, ResponseCode::RegistrationSuccess, record.id.as_bytes()).await
        }
        Err(err) => {
            debug!("registration of '{name}' failed: {err}");
            send_response(stream, ResponseCode::RegistrationFailed, &[]).await
        }
    }
}

/// Generates, wraps, and records a fresh session key for a known client,
/// then replies 1602 with `identifier ‖ wrapped session key`.
async fn issue_session_key(
    server: &Server,
    stream: &mut TcpStream,
    client_id: Uuid,
    public_key: &PublicKey,
) -> Result<SessionKey> {
    let session_key = SessionKey::generate();
    let wrapped = match public_key.wrap_session_key(&session_key) {
        Ok(wrapped) => wrapped,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::GenericServerError,
                proto_error!(ErrorKind::Crypto, "wrapping session key for {client_id}: {err}"),
            )
            .await
        }
    };
    if let Err(err) = server.registry.record_key_exchange(client_id, *session_key.as_bytes()).await {
        return fail(
            stream,
            ResponseCode::GenericServerError,
            proto_error!(ErrorKind::Storage, "recording session key for {client_id}: {err}"),
        )
        .await;
    }

    let mut payload = Vec::with_capacity(IDENTIFIER_SIZE + wrapped.len());
    payload.extend_from_slice(client_id.as_bytes());
    payload.extend_from_slice(&wrapped);
    send_response(stream, ResponseCode::PublicKeyAcceptedWithSessionKey, &payload).await?;
    Ok(session_key)
}

async fn handle_publish_public_key(
    server: &Server,
    stream: &mut TcpStream,
    client_id: Uuid,
    payload: &[u8],
    session: &mut Option<ActiveSession>,
) -> Result<()> {
    if payload.len() != NAME_FIELD_SIZE + crate::crypto::PUBLIC_KEY_WIRE_SIZE {
        send_response(stream, ResponseCode::MalformedHeader, &[]).await?;
        return Err(anyhow!("PublishPublicKey payload has wrong length {}", payload.len()));
    }
    let name_buf: &[u8; NAME_FIELD_SIZE] = payload[..NAME_FIELD_SIZE].try_into().unwrap();
    let name = decode_name(name_buf)?;
    let key_bytes = &payload[NAME_FIELD_SIZE..];

    let lookup = match server.registry.find_by_id(client_id).await {
        Ok(lookup) => lookup,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::GenericServerError,
                proto_error!(ErrorKind::Storage, "looking up client {client_id}: {err}"),
            )
            .await
        }
    };
    let Some(record) = lookup else {
        send_response(stream, ResponseCode::UnknownClientOrCode, &[]).await?;
        return Err(anyhow!("PublishPublicKey for unknown client {client_id}"));
    };
    if record.name != name {
        send_response(stream, ResponseCode::MalformedHeader, &[]).await?;
        return Err(anyhow!("PublishPublicKey name '{name}' does not match record for {client_id}"));
    }

    let public_key = match PublicKey::from_wire_bytes(key_bytes) {
        Ok(key) => key,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::GenericServerError,
                proto_error!(ErrorKind::Crypto, "decoding public key from {client_id}: {err}"),
            )
            .await
        }
    };
    let wire_bytes: [u8; crate::crypto::PUBLIC_KEY_WIRE_SIZE] =
        key_bytes.try_into().expect("length checked above");
    if let Err(err) = server.registry.set_public_key(client_id, wire_bytes).await {
        return fail(
            stream,
            ResponseCode::GenericServerError,
            proto_error!(ErrorKind::Storage, "persisting public key for {client_id}: {err}"),
        )
        .await;
    }

    let session_key = issue_session_key(server, stream, client_id, &public_key).await?;
    *session = Some(ActiveSession::new(client_id, session_key));
    Ok(())
}

async fn handle_reconnect(
    server: &Server,
    stream: &mut TcpStream,
    client_id: Uuid,
    payload: &[u8],
    session: &mut Option<ActiveSession>,
) -> Result<()> {
    let name_buf: &[u8; NAME_FIELD_SIZE] = payload
        .try_into()
        .map_err(|_| anyhow!("Reconnect payload is {} bytes, expected {NAME_FIELD_SIZE}", payload.len()))?;
    let name = decode_name(name_buf)?;

    let record = match server.registry.find_by_id(client_id).await {
        Ok(record) => record,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::GenericServerError,
                proto_error!(ErrorKind::Storage, "looking up client {client_id}: {err}"),
            )
            .await
        }
    };
    let (record, public_key_bytes) = match record {
        Some(record) if record.name == name && record.public_key.is_some() => {
            let key = record.public_key.unwrap();
            (record, key)
        }
        _ => {
            send_response(stream, ResponseCode::UnknownClientOrCode, &[]).await?;
            return Err(anyhow!("Reconnect rejected for {client_id} ('{name}')"));
        }
    };

    let public_key = match PublicKey::from_wire_bytes(&public_key_bytes) {
        Ok(key) => key,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::GenericServerError,
                proto_error!(ErrorKind::Crypto, "decoding stored public key for {}: {err}", record.id),
            )
            .await
        }
    };
    let session_key = issue_session_key(server, stream, record.id, &public_key).await?;
    *session = Some(ActiveSession::new(record.id, session_key));
    Ok(())
}

async fn handle_send_file(
    server: &Server,
    stream: &mut TcpStream,
    client_id: Uuid,
    payload: &[u8],
    session: &mut Option<ActiveSession>,
) -> Result<()> {
    let Some(active) = session.as_mut().filter(|s| s.client_id == client_id) else {
        return fail(
            stream,
            ResponseCode::UnknownClientOrCode,
            anyhow!("SendFile with no matching active session for {client_id}"),
        )
        .await;
    };

    if payload.len() < FilePacketHeader::WIRE_SIZE {
        return fail(
            stream,
            ResponseCode::MalformedHeader,
            anyhow!("SendFile payload shorter than a packet header"),
        )
        .await;
    }
    let mut cursor = Cursor::new(payload);
    let packet_header = match FilePacketHeader::read(&mut cursor).await {
        Ok(header) => header,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::MalformedHeader,
                proto_error!(ErrorKind::Protocol, "decoding packet header: {err}"),
            )
            .await
        }
    };
    let ciphertext_chunk = &payload[FilePacketHeader::WIRE_SIZE..];

    let append_result = active
        .pending_for_packet(
            &packet_header.filename,
            packet_header.packet_index,
            packet_header.total_packets,
            packet_header.original_size,
            packet_header.encrypted_size,
        )
        .and_then(|pending| {
            pending.append_packet(packet_header.packet_index, packet_header.total_packets, ciphertext_chunk)
        });
    if let Err(err) = append_result {
        return fail(
            stream,
            ResponseCode::MalformedHeader,
            proto_error!(ErrorKind::Protocol, "packet for '{}' rejected: {err}", packet_header.filename),
        )
        .await;
    }

    let Some(completed) = active.take_completed(&packet_header.filename) else {
        return Ok(());
    };

    if completed.buffer.len() != completed.declared_encrypted_size as usize {
        return fail(
            stream,
            ResponseCode::GenericServerError,
            proto_error!(
                ErrorKind::Integrity,
                "accumulated {} bytes does not match declared encrypted size {}",
                completed.buffer.len(),
                completed.declared_encrypted_size
            ),
        )
        .await;
    }

    let plaintext = match active.session_key.decrypt(&completed.buffer) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::GenericServerError,
                proto_error!(ErrorKind::Crypto, "decrypting uploaded file: {err}"),
            )
            .await
        }
    };
    if plaintext.len() != completed.declared_original_size as usize {
        return fail(
            stream,
            ResponseCode::GenericServerError,
            proto_error!(
                ErrorKind::Integrity,
                "decrypted length {} does not match declared original size {}",
                plaintext.len(),
                completed.declared_original_size
            ),
        )
        .await;
    }

    let storage_path = match sanitize_filename(&server.settings.storage_dir, &completed.filename) {
        Ok(path) => path,
        Err(err) => {
            return fail(
                stream,
                ResponseCode::GenericServerError,
                proto_error!(ErrorKind::Storage, "sanitizing filename '{}': {err}", completed.filename),
            )
            .await
        }
    };
    if let Err(err) = persist_atomically(&storage_path, &plaintext) {
        return fail(
            stream,
            ResponseCode::GenericServerError,
            proto_error!(ErrorKind::Storage, "persisting '{}': {err}", storage_path.display()),
        )
        .await;
    }
    let crc = cksum(&plaintext);
    if let Err(err) = server
        .registry
        .record_file_outcome(client_id, &completed.filename, storage_path.to_str(), false)
        .await
    {
        return fail(
            stream,
            ResponseCode::GenericServerError,
            proto_error!(ErrorKind::Storage, "recording file outcome for '{}': {err}", completed.filename),
        )
        .await;
    }

    let mut response_payload = Vec::with_capacity(IDENTIFIER_SIZE + 4 + NAME_FIELD_SIZE + 4);
    response_payload.extend_from_slice(client_id.as_bytes());
    response_payload.write_u32::<LittleEndian>(completed.declared_original_size)?;
    response_payload.extend_from_slice(&encode_name(&completed.filename)?);
    response_payload.write_u32::<LittleEndian>(crc)?;
    send_response(stream, ResponseCode::FileReceivedWithCrc, &response_payload).await
}

async fn handle_crc_report(
    server: &Server,
    stream: &mut TcpStream,
    client_id: Uuid,
    code: RequestCode,
    payload: &[u8],
    session: &mut Option<ActiveSession>,
) -> Result<()> {
    let name_buf: &[u8; NAME_FIELD_SIZE] = payload
        .try_into()
        .map_err(|_| anyhow!("CRC report payload is {} bytes, expected {NAME_FIELD_SIZE}", payload.len()))?;
    let filename = decode_name(name_buf)?;

    let Some(active) = session.as_mut().filter(|s| s.client_id == client_id) else {
        return fail(
            stream,
            ResponseCode::UnknownClientOrCode,
            anyhow!("CRC report with no matching active session for {client_id}"),
        )
        .await;
    };

    match code {
        RequestCode::CrcOk => {
            if let Err(err) = server.registry.record_file_outcome(active.client_id, &filename, None, true).await
            {
                return fail(
                    stream,
                    ResponseCode::GenericServerError,
                    proto_error!(ErrorKind::Storage, "recording verified outcome for '{filename}': {err}"),
                )
                .await;
            }
        }
        RequestCode::CrcRetry => {
            active.discard_pending(&filename);
        }
        RequestCode::CrcFailed => {
            active.discard_pending(&filename);
            if let Err(err) = server.registry.record_file_outcome(active.client_id, &filename, None, false).await
            {
                return fail(
                    stream,
                    ResponseCode::GenericServerError,
                    proto_error!(ErrorKind::Storage, "recording failed outcome for '{filename}': {err}"),
                )
                .await;
            }
        }
        _ => unreachable!("handle_crc_report only called for CRC report codes"),
    }

    send_response(stream, ResponseCode::GenericAck, &[]).await
}
