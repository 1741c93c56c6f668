//! Network Module Implementation
//!
//! This module turns a raw TCP byte stream into discrete messages and back.
//!
//! # Components
//!
//! - `Message`: one decoded envelope (id, optional request id, header, body)
//! - `MessageCodec`: length-prefixed envelope encoding and decoding, with
//!   scratch buffers from the buffer pool and optional byte-rate throttling
//! - `Session`: per-connection handle serializing writes
//! - `SessionReader`: the read half consumed by the connection read loop
//!
//! # Features
//!
//! - Asynchronous I/O on tokio streams
//! - Frame size validation before any payload is read or written
//! - Peer-closed and locally-closed streams reported distinctly

pub use codec::{CodecConfig, MessageCodec, MAX_MESSAGE_SIZE};
pub use message::{Message, RequestId, REQUEST_ID_LEN};
pub use session::{Session, SessionReader};

#[cfg(test)]
pub(crate) use session::test_util;

mod codec;
mod message;
mod session;
