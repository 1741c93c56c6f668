// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Envelope codec.
//!
//! Every message travels as one little-endian envelope:
//!
//! ```text
//! u32 total_length              -- bytes after this field
//! [u8; 36] request_id           -- correlation-aware framing only
//! i32 message_id
//! u32 header_length, header bytes
//! u32 body_length,   body bytes
//! ```
//!
//! The codec owns the scratch [`BufferPool`] and the [`IoRateLimiter`];
//! build one per deployment and share it by `Arc` between sessions.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{Message, RequestId, REQUEST_ID_LEN};
use crate::utils::{BufferPool, IoRateLimiter, PooledBuf};
use crate::{AppError, AppResult};

/// Default upper bound for `total_length` and `body_length`.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
const LENGTH_FIELD_SIZE: usize = 4;

#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub max_message_size: usize,
    /// Whether envelopes carry a request id. Both ends of a connection must
    /// agree on this; a mismatch shows up as a framing error.
    pub correlation_id: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            max_message_size: MAX_MESSAGE_SIZE,
            correlation_id: false,
        }
    }
}

#[derive(Debug)]
pub struct MessageCodec {
    config: CodecConfig,
    buffers: Arc<BufferPool>,
    limiter: Arc<IoRateLimiter>,
}

impl MessageCodec {
    pub fn new(config: CodecConfig, buffers: Arc<BufferPool>, limiter: Arc<IoRateLimiter>) -> Self {
        MessageCodec {
            config,
            buffers,
            limiter,
        }
    }

    /// Codec with a private buffer pool and throttling disabled.
    pub fn unthrottled(config: CodecConfig) -> Self {
        Self::new(
            config,
            Arc::new(BufferPool::default()),
            Arc::new(IoRateLimiter::disabled()),
        )
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    fn request_id_len(&self) -> usize {
        if self.config.correlation_id {
            REQUEST_ID_LEN
        } else {
            0
        }
    }

    /// Length of everything in the envelope except the body.
    fn prefix_len(&self, header_len: usize) -> usize {
        LENGTH_FIELD_SIZE + self.request_id_len() + 4 + LENGTH_FIELD_SIZE + header_len + LENGTH_FIELD_SIZE
    }

    fn check_outgoing(&self, header_len: usize, body_len: usize) -> AppResult<usize> {
        let max = self.config.max_message_size;
        if body_len > max {
            return Err(AppError::MessageTooLarge {
                size: body_len,
                max,
            });
        }
        let total = self.prefix_len(header_len) - LENGTH_FIELD_SIZE + body_len;
        if total > max {
            return Err(AppError::MessageTooLarge { size: total, max });
        }
        Ok(total)
    }

    fn put_prefix<B: BufMut>(
        &self,
        dst: &mut B,
        total: usize,
        msg_id: i32,
        request_id: Option<&RequestId>,
        header: &[u8],
        body_len: usize,
    ) {
        dst.put_u32_le(total as u32);
        if self.config.correlation_id {
            let request_id = request_id.copied().unwrap_or_else(RequestId::new_random);
            dst.put_slice(request_id.as_bytes());
        }
        dst.put_i32_le(msg_id);
        dst.put_u32_le(header.len() as u32);
        dst.put_slice(header);
        dst.put_u32_le(body_len as u32);
    }

    /// Encodes a complete envelope into a single buffer.
    pub fn encode(&self, msg_id: i32, header: &[u8], body: &[u8]) -> AppResult<BytesMut> {
        let total = self.check_outgoing(header.len(), body.len())?;
        let mut dst = BytesMut::with_capacity(LENGTH_FIELD_SIZE + total);
        self.put_prefix(&mut dst, total, msg_id, None, header, body.len());
        dst.put_slice(body);
        Ok(dst)
    }

    /// Encodes everything but the body into a pooled scratch buffer.
    ///
    /// With correlation-aware framing a fresh request id is generated unless
    /// one is supplied.
    pub fn encode_prefix(
        &self,
        msg_id: i32,
        request_id: Option<&RequestId>,
        header: &[u8],
        body_len: usize,
    ) -> AppResult<PooledBuf<'_>> {
        let total = self.check_outgoing(header.len(), body_len)?;
        let mut prefix = self.buffers.acquire(self.prefix_len(header.len()));
        let mut dst: &mut [u8] = &mut prefix;
        self.put_prefix(&mut dst, total, msg_id, request_id, header, body_len);
        Ok(prefix)
    }

    /// Waits on the send bucket for a body of `body_len` bytes.
    pub async fn throttle_send(&self, body_len: usize) {
        self.limiter.throttle_send(body_len).await;
    }

    /// Writes an encoded prefix followed by the body: two writes, no
    /// interleaving as long as the caller holds the writer exclusively.
    pub async fn write_encoded<W>(&self, writer: &mut W, prefix: &[u8], body: &[u8]) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(prefix).await?;
        if !body.is_empty() {
            writer.write_all(body).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Encodes and writes one message, applying send throttling first.
    pub async fn write_message<W>(
        &self,
        writer: &mut W,
        msg_id: i32,
        header: &[u8],
        body: &[u8],
    ) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        let prefix = self.encode_prefix(msg_id, None, header, body.len())?;
        self.throttle_send(body.len()).await;
        self.write_encoded(writer, &prefix, body).await
    }

    /// Reads the leading length prefix.
    ///
    /// `Ok(None)` means the peer closed the stream cleanly between frames.
    async fn read_frame_length<R>(&self, reader: &mut R) -> AppResult<Option<u32>>
    where
        R: AsyncRead + Unpin,
    {
        let mut scratch = self.buffers.acquire(LENGTH_FIELD_SIZE);
        let mut filled = 0;
        while filled < LENGTH_FIELD_SIZE {
            let n = reader.read(&mut scratch[filled..]).await?;
            if n == 0 {
                return if filled == 0 {
                    Ok(None)
                } else {
                    Err(AppError::Truncated(format!(
                        "stream ended after {} of {} length bytes",
                        filled, LENGTH_FIELD_SIZE
                    )))
                };
            }
            filled += n;
        }
        Ok(Some(u32::from_le_bytes([
            scratch[0], scratch[1], scratch[2], scratch[3],
        ])))
    }

    async fn read_u32<R>(&self, reader: &mut R, remaining: &mut usize, field: &str) -> AppResult<u32>
    where
        R: AsyncRead + Unpin,
    {
        take(remaining, LENGTH_FIELD_SIZE, field)?;
        let mut scratch = self.buffers.acquire(LENGTH_FIELD_SIZE);
        read_full(reader, &mut scratch, field).await?;
        Ok(u32::from_le_bytes([
            scratch[0], scratch[1], scratch[2], scratch[3],
        ]))
    }

    async fn read_section<R>(
        &self,
        reader: &mut R,
        remaining: &mut usize,
        len: usize,
        field: &str,
    ) -> AppResult<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        take(remaining, len, field)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        // payload outlives the read call, so it never comes from the pool
        let mut section = vec![0u8; len];
        read_full(reader, &mut section, field).await?;
        Ok(Bytes::from(section))
    }

    /// Reads one full envelope.
    ///
    /// A clean end of stream before the first byte is reported as
    /// [`AppError::PeerClosed`]; anything cut short inside a frame is a
    /// framing error.
    pub async fn read_message<R>(&self, reader: &mut R) -> AppResult<Message>
    where
        R: AsyncRead + Unpin,
    {
        let total = match self.read_frame_length(reader).await? {
            Some(total) => total,
            None => return Err(AppError::PeerClosed),
        };
        let max = self.config.max_message_size;
        if total as usize > max {
            return Err(AppError::MessageTooLarge {
                size: total as usize,
                max,
            });
        }
        self.limiter.throttle_recv(total as usize).await;

        let mut remaining = total as usize;
        let mut message = Message {
            size: total,
            ..Message::default()
        };

        if self.config.correlation_id {
            take(&mut remaining, REQUEST_ID_LEN, "request id")?;
            let mut request_id = [0u8; REQUEST_ID_LEN];
            read_full(reader, &mut request_id, "request id").await?;
            message.request_id = Some(RequestId::from_bytes(request_id));
        }

        message.id = self.read_u32(reader, &mut remaining, "message id").await? as i32;

        let header_len = self.read_u32(reader, &mut remaining, "header length").await? as usize;
        message.header = self
            .read_section(reader, &mut remaining, header_len, "header")
            .await?;

        let body_len = self.read_u32(reader, &mut remaining, "body length").await? as usize;
        if body_len > max {
            return Err(AppError::MessageTooLarge { size: body_len, max });
        }
        message.body = self
            .read_section(reader, &mut remaining, body_len, "body")
            .await?;

        if remaining != 0 {
            return Err(AppError::MalformedFrame(format!(
                "frame length {} leaves {} undeclared bytes",
                total, remaining
            )));
        }
        Ok(message)
    }
}

/// Consumes `n` bytes of the declared frame length.
fn take(remaining: &mut usize, n: usize, field: &str) -> AppResult<()> {
    if n > *remaining {
        return Err(AppError::MalformedFrame(format!(
            "{} needs {} bytes but only {} remain in the frame",
            field, n, remaining
        )));
    }
    *remaining -= n;
    Ok(())
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8], field: &str) -> AppResult<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(AppError::Truncated(
            format!("stream ended while reading {}", field),
        )),
        Err(err) => Err(err.into()),
    }
}
