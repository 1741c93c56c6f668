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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::codec::MessageCodec;
use super::message::{Message, RequestId};
use crate::service::is_disconnect;
use crate::{AppError, AppResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one live connection.
///
/// The write half sits behind an async mutex, so concurrent senders never
/// interleave envelope bytes. The read half is handed out once, as a
/// [`SessionReader`], to the connection's single read loop.
#[derive(Debug)]
pub struct Session {
    id: u64,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    codec: Arc<MessageCodec>,
    closed: CancellationToken,
}

impl Session {
    pub fn new(socket: TcpStream, codec: Arc<MessageCodec>) -> AppResult<(Arc<Session>, SessionReader)> {
        let remote_addr = socket.peer_addr()?;
        let local_addr = socket.local_addr()?;
        let (reader, writer) = socket.into_split();
        let closed = CancellationToken::new();

        let session = Arc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            local_addr,
            writer: Mutex::new(writer),
            codec: codec.clone(),
            closed: closed.clone(),
        });
        let reader = SessionReader {
            session_id: session.id,
            reader,
            codec,
            closed,
        };
        Ok((session, reader))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote(&self) -> String {
        self.remote_addr.to_string()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn codec(&self) -> &Arc<MessageCodec> {
        &self.codec
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session has been closed locally.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Sends one message. The envelope prefix and the body are written under
    /// the session write lock.
    pub async fn send(&self, msg_id: i32, header: &[u8], body: &[u8]) -> AppResult<()> {
        self.send_inner(msg_id, None, header, body).await
    }

    /// Like [`Session::send`] but with an explicit correlation token, used
    /// when answering a request on correlation-aware framing.
    pub async fn send_correlated(
        &self,
        msg_id: i32,
        request_id: Option<&RequestId>,
        header: &[u8],
        body: &[u8],
    ) -> AppResult<()> {
        self.send_inner(msg_id, request_id, header, body).await
    }

    async fn send_inner(
        &self,
        msg_id: i32,
        request_id: Option<&RequestId>,
        header: &[u8],
        body: &[u8],
    ) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::LocalClosed);
        }
        let prefix = self
            .codec
            .encode_prefix(msg_id, request_id, header, body.len())?;
        let write = async {
            // throttle before taking the lock so a slow bucket does not stall
            // other senders on this session
            self.codec.throttle_send(body.len()).await;
            let mut writer = self.writer.lock().await;
            self.codec.write_encoded(&mut *writer, &prefix, body).await
        };
        // a close abandons the write and releases the lock
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(AppError::LocalClosed),
            res = write => res?,
        }
        trace!(session = self.id, msg_id, body_len = body.len(), "message sent");
        Ok(())
    }

    /// Sends with an absolute deadline.
    ///
    /// A timed-out write may have left part of an envelope on the wire, so
    /// the session is closed when the deadline expires.
    pub async fn send_with_deadline(
        &self,
        deadline: Instant,
        msg_id: i32,
        header: &[u8],
        body: &[u8],
    ) -> AppResult<()> {
        match time::timeout_at(deadline, self.send(msg_id, header, body)).await {
            Ok(result) => result,
            Err(_) => {
                self.close().await?;
                Err(AppError::Timeout(format!(
                    "send of message {} to {}",
                    msg_id, self.remote_addr
                )))
            }
        }
    }

    pub async fn send_text(&self, msg_id: i32, text: &str) -> AppResult<()> {
        self.send(msg_id, &[], text.as_bytes()).await
    }

    pub async fn send_json<T>(&self, msg_id: i32, data: &T) -> AppResult<()>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(data)?;
        self.send(msg_id, &[], &body).await
    }

    /// Sends raw bytes with a JSON header describing them.
    pub async fn send_stream<H>(&self, msg_id: i32, header: &H, body: &[u8]) -> AppResult<()>
    where
        H: Serialize + ?Sized,
    {
        let header = serde_json::to_vec(header)?;
        self.send(msg_id, &header, body).await
    }

    /// Closes the connection. The read loop observes the close and exits
    /// with [`AppError::LocalClosed`]; pending sends, including one blocked
    /// on a peer that stopped reading, fail with the same error. Calling
    /// this more than once is fine.
    pub async fn close(&self) -> AppResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => {}
            Err(err) if is_disconnect(&err) => {}
            Err(err) => return Err(err.into()),
        }
        debug!(session = self.id, remote = %self.remote_addr, "session closed");
        Ok(())
    }
}

/// Read side of a [`Session`], owned by its read loop.
#[derive(Debug)]
pub struct SessionReader {
    session_id: u64,
    reader: OwnedReadHalf,
    codec: Arc<MessageCodec>,
    closed: CancellationToken,
}

impl SessionReader {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Reads the next message, or fails with `LocalClosed` once the session
    /// has been closed from this side.
    pub async fn read_message(&mut self) -> AppResult<Message> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(AppError::LocalClosed),
            res = self.codec.read_message(&mut self.reader) => res,
        }
    }
}
