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
use std::sync::Arc;

use bytes::{buf::Reader, Buf, Bytes};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::handler::{Cursor, HandlerChain, HandlerFuture};
use crate::network::{Message, RequestId, Session};
use crate::AppResult;

/// Per-message dispatch state: the decoded message, the session it arrived
/// on, and the position in the resolved handler chain.
#[derive(Debug)]
pub struct Context {
    session: Arc<Session>,
    message: Message,
    chain: HandlerChain,
    cursor: Cursor,
}

impl Context {
    pub fn new(session: Arc<Session>, message: Message, chain: HandlerChain) -> Self {
        Context {
            session,
            message,
            chain,
            cursor: Cursor::default(),
        }
    }

    /// Runs the chain from its first handler.
    pub(crate) async fn run(&mut self) {
        self.run_chain().await
    }

    /// Runs the remaining handlers.
    ///
    /// Called from middleware: everything before the call runs on the way in,
    /// everything after it on the way out.
    pub fn next(&mut self) -> HandlerFuture<'_> {
        self.cursor.advance();
        self.run_chain()
    }

    fn run_chain(&mut self) -> HandlerFuture<'_> {
        Box::pin(async move {
            while let Some(handler) = self.chain.get(&self.cursor) {
                handler.call(self).await;
                self.cursor.advance();
            }
        })
    }

    /// Stops the chain: no handler after the current one runs, in this frame
    /// or in any middleware waiting on `next()`. The current handler keeps
    /// running until it returns.
    pub fn abort(&mut self) {
        self.cursor.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.cursor.is_aborted()
    }

    // session

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn remote(&self) -> String {
        self.session.remote()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.session.remote_addr()
    }

    pub async fn close(&self) -> AppResult<()> {
        self.session.close().await
    }

    // message

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn msg_id(&self) -> i32 {
        self.message.id()
    }

    pub fn msg_size(&self) -> u32 {
        self.message.size()
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.message.request_id()
    }

    pub fn header(&self) -> &Bytes {
        self.message.header()
    }

    pub fn header_bind_json<T: DeserializeOwned>(&self) -> AppResult<T> {
        Ok(serde_json::from_slice(self.message.header())?)
    }

    pub fn body(&self) -> &Bytes {
        self.message.body()
    }

    /// Body as text; invalid UTF-8 is replaced rather than rejected.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.message.body()).into_owned()
    }

    pub fn bind_json<T: DeserializeOwned>(&self) -> AppResult<T> {
        Ok(serde_json::from_slice(self.message.body())?)
    }

    pub fn reader(&self) -> Reader<Bytes> {
        self.message.body().clone().reader()
    }

    /// Copies the body into `writer`, returning the number of bytes written.
    pub async fn copy_to<W>(&self, writer: &mut W) -> AppResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let body = self.message.body();
        writer.write_all(body).await?;
        writer.flush().await?;
        Ok(body.len() as u64)
    }

    // response

    pub async fn send(&self, msg_id: i32, header: &[u8], body: &[u8]) -> AppResult<()> {
        self.session.send(msg_id, header, body).await
    }

    /// Sends a response carrying the request id of the message being handled.
    pub async fn reply(&self, msg_id: i32, header: &[u8], body: &[u8]) -> AppResult<()> {
        self.session
            .send_correlated(msg_id, self.message.request_id(), header, body)
            .await
    }

    pub async fn send_text(&self, msg_id: i32, text: &str) -> AppResult<()> {
        self.session.send_text(msg_id, text).await
    }

    pub async fn send_json<T>(&self, msg_id: i32, data: &T) -> AppResult<()>
    where
        T: Serialize + ?Sized,
    {
        self.session.send_json(msg_id, data).await
    }

    pub async fn send_stream<H>(&self, msg_id: i32, header: &H, body: &[u8]) -> AppResult<()>
    where
        H: Serialize + ?Sized,
    {
        self.session.send_stream(msg_id, header, body).await
    }
}
