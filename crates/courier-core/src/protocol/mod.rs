//! Wire codec for message envelopes.
//!
//! `Protocol` turns a `Message` into a self-delimiting frame and back. The
//! envelope metadata travels as a JSON header part and the payload as a raw
//! data part. Compression and encryption are independent stages, applied as
//! compress-then-encrypt on send and decrypt-then-decompress on receive.
//!
//! # Size checks
//!
//! Senders reject payloads above the negotiated maximum before writing any
//! byte. Receivers learn the payload size from the header, so an oversized
//! data part can be skipped without decrypting or decoding it.

pub mod compressor;
pub mod encryptor;
pub mod frame;
pub mod payload;

pub use compressor::Compressor;
pub use encryptor::{DiffieHellmanKeys, Encryptor};

use crate::config::IpcConfig;
use crate::message::{Message, MessageType, ResponseStatus, Topics};
use crate::{CourierError, Result};
use bytes::Bytes;
use frame::{FLAG_COMPRESSED, FLAG_ENCRYPTED, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

/// Envelope metadata as carried in the header part.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<Uuid>,
    #[serde(rename = "type")]
    msg_type: MessageType,
    #[serde(default)]
    status: ResponseStatus,
    #[serde(default)]
    oneway: bool,
    #[serde(default)]
    transient: bool,
    #[serde(default)]
    subscription_reply: bool,
    timestamp: i64,
    expires_at: i64,
    timeout: i64,
    topics: Topics,
    mimetype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    charset: Option<String>,
    data_size: usize,
}

impl EnvelopeHeader {
    fn of(msg: &Message) -> Self {
        Self {
            id: msg.id,
            request_id: msg.request_id,
            msg_type: msg.msg_type,
            status: msg.response_status,
            oneway: msg.oneway,
            transient: msg.transient,
            subscription_reply: msg.subscription_reply,
            timestamp: msg.timestamp,
            expires_at: msg.expires_at,
            timeout: msg.timeout,
            topics: msg.topics.clone(),
            mimetype: msg.mimetype.clone(),
            charset: msg.charset.clone(),
            data_size: msg.data.len(),
        }
    }

    fn into_message(self, data: Bytes) -> Message {
        Message {
            id: self.id,
            request_id: self.request_id,
            msg_type: self.msg_type,
            response_status: self.status,
            oneway: self.oneway,
            transient: self.transient,
            subscription_reply: self.subscription_reply,
            timestamp: self.timestamp,
            expires_at: self.expires_at,
            timeout: self.timeout,
            topics: self.topics,
            mimetype: self.mimetype,
            charset: self.charset,
            data,
        }
    }
}

/// Result of a size-limited receive.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    /// The declared payload exceeded the limit. The payload was skipped and
    /// `request` carries the envelope metadata with an empty payload.
    Oversized { request: Message, size: usize },
}

/// Stateless envelope codec.
pub struct Protocol;

impl Protocol {
    /// Encode `msg` into a complete frame.
    pub fn encode(
        msg: &Message,
        compressor: &Compressor,
        encryptor: &Encryptor,
        max_message_size: usize,
    ) -> Result<Vec<u8>> {
        if msg.data.len() > max_message_size {
            return Err(CourierError::MessageTooLarge {
                size: msg.data.len(),
                max: max_message_size,
            });
        }

        let mut flags = 0u8;
        let header = serde_json::to_vec(&EnvelopeHeader::of(msg))?;

        let data = if compressor.needs_compression(msg.data.len()) {
            flags |= FLAG_COMPRESSED;
            compressor.compress(&msg.data)?
        } else {
            msg.data.to_vec()
        };

        let (header, data) = if encryptor.is_active() {
            flags |= FLAG_ENCRYPTED;
            (encryptor.encrypt(&header)?, encryptor.encrypt(&data)?)
        } else {
            (header, data)
        };

        let mut buf = Vec::with_capacity(2 + 8 + header.len() + data.len());
        buf.push(PROTOCOL_VERSION);
        buf.push(flags);
        frame::put_part(&mut buf, &header)?;
        frame::put_part(&mut buf, &data)?;
        Ok(buf)
    }

    /// Encode and write `msg`. Nothing is written if the payload is too large.
    pub async fn send_message<W: AsyncWrite + Unpin>(
        writer: &mut W,
        msg: &Message,
        compressor: &Compressor,
        encryptor: &Encryptor,
        max_message_size: usize,
    ) -> Result<()> {
        let frame = Self::encode(msg, compressor, encryptor, max_message_size)?;
        frame::write_frame(writer, &frame).await?;
        debug!(id = %msg.id, msg_type = %msg.msg_type, bytes = frame.len(), "sent message");
        Ok(())
    }

    /// Read the next envelope.
    ///
    /// Returns `None` when the peer closed the stream between frames.
    pub async fn receive_message<R: AsyncRead + Unpin>(
        reader: &mut R,
        encryptor: &Encryptor,
    ) -> Result<Option<Message>> {
        match Self::receive_limited(reader, encryptor, IpcConfig::MAX_FRAME_PART_SIZE).await? {
            None => Ok(None),
            Some(Inbound::Message(msg)) => Ok(Some(msg)),
            Some(Inbound::Oversized { size, .. }) => Err(CourierError::MessageTooLarge {
                size,
                max: IpcConfig::MAX_FRAME_PART_SIZE,
            }),
        }
    }

    /// Read the next envelope, skipping its payload if the declared size
    /// exceeds `max_message_size`.
    pub async fn receive_limited<R: AsyncRead + Unpin>(
        reader: &mut R,
        encryptor: &Encryptor,
        max_message_size: usize,
    ) -> Result<Option<Inbound>> {
        let Some((_, flags)) = frame::read_preamble(reader).await? else {
            return Ok(None);
        };
        let encrypted = flags & FLAG_ENCRYPTED != 0;
        let compressed = flags & FLAG_COMPRESSED != 0;

        if encrypted != encryptor.is_active() {
            return Err(CourierError::Encryption {
                message: if encrypted {
                    "received an encrypted frame on a plain session".to_string()
                } else {
                    "received a plain frame on an encrypted session".to_string()
                },
            });
        }

        let header = frame::read_part(reader).await?;
        let header = encryptor.decrypt(&header)?;
        let header: EnvelopeHeader = serde_json::from_slice(&header)
            .map_err(|e| CourierError::invalid_message(format!("bad envelope header: {}", e)))?;

        let data_len = frame::read_part_len(reader).await?;
        if header.data_size > max_message_size {
            frame::skip_part_body(reader, data_len).await?;
            let size = header.data_size;
            debug!(id = %header.id, size, max = max_message_size, "skipped oversized payload");
            return Ok(Some(Inbound::Oversized {
                request: header.into_message(Bytes::new()),
                size,
            }));
        }

        let data = frame::read_part_body(reader, data_len).await?;
        let data = encryptor.decrypt(&data)?;
        let data = if compressed {
            Compressor::decompress(&data, header.data_size)?
        } else {
            data
        };
        if data.len() != header.data_size {
            return Err(CourierError::invalid_message(format!(
                "payload size {} does not match declared size {}",
                data.len(),
                header.data_size
            )));
        }

        let msg = header.into_message(Bytes::from(data));
        debug!(id = %msg.id, msg_type = %msg.msg_type, "received message");
        Ok(Some(Inbound::Message(msg)))
    }

    /// Decode one complete unencrypted frame held in memory.
    pub fn decode(frame: &[u8]) -> Result<Message> {
        let truncated = || CourierError::invalid_message("truncated frame");
        let (preamble, rest) = frame.split_first_chunk::<2>().ok_or_else(truncated)?;
        if preamble[0] != PROTOCOL_VERSION {
            return Err(CourierError::invalid_message(format!(
                "unsupported protocol version {}",
                preamble[0]
            )));
        }
        if preamble[1] & FLAG_ENCRYPTED != 0 {
            return Err(CourierError::Encryption {
                message: "cannot decode an encrypted frame without a session".to_string(),
            });
        }

        let (header, rest) = split_part(rest).ok_or_else(truncated)?;
        let (data, rest) = split_part(rest).ok_or_else(truncated)?;
        if !rest.is_empty() {
            return Err(CourierError::invalid_message("trailing bytes after frame"));
        }

        let header: EnvelopeHeader = serde_json::from_slice(header)
            .map_err(|e| CourierError::invalid_message(format!("bad envelope header: {}", e)))?;
        let data = if preamble[1] & FLAG_COMPRESSED != 0 {
            Compressor::decompress(data, header.data_size)?
        } else {
            data.to_vec()
        };
        if data.len() != header.data_size {
            return Err(CourierError::invalid_message(format!(
                "payload size {} does not match declared size {}",
                data.len(),
                header.data_size
            )));
        }
        Ok(header.into_message(Bytes::from(data)))
    }
}

fn split_part(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = buf.split_first_chunk::<4>()?;
    let len = u32::from_be_bytes(*len) as usize;
    (rest.len() >= len).then(|| rest.split_at(len))
}
