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

use std::fmt;

use bytes::Bytes;
use uuid::Uuid;

/// Width of the correlation token on the wire: a hyphenated UUID string.
pub const REQUEST_ID_LEN: usize = 36;

/// Opaque correlation token carried by correlation-aware framing.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    pub fn new_random() -> Self {
        let mut id = [0u8; REQUEST_ID_LEN];
        Uuid::new_v4().hyphenated().encode_lower(&mut id);
        RequestId(id)
    }

    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        RequestId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

/// One decoded envelope.
///
/// `size` is the number of bytes the envelope occupied after the leading
/// length prefix.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub(crate) size: u32,
    pub(crate) id: i32,
    pub(crate) request_id: Option<RequestId>,
    pub(crate) header: Bytes,
    pub(crate) body: Bytes,
}

impl Message {
    /// Builds a message as it would be decoded from plain (non-correlated)
    /// framing.
    pub fn new(id: i32, header: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        let header = header.into();
        let body = body.into();
        let size = (4 + 4 + header.len() + 4 + body.len()) as u32;
        Message {
            size,
            id,
            request_id: None,
            header,
            body,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn header(&self) -> &Bytes {
        &self.header
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("request_id", &self.request_id)
            .field("header_len", &self.header.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ID={} HeadLen={} DataLen={}",
            self.id,
            self.header.len(),
            self.body.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_a_hyphenated_uuid() {
        let id = RequestId::new_random();
        let text = id.to_string();
        assert_eq!(text.len(), REQUEST_ID_LEN);
        assert!(Uuid::parse_str(&text).is_ok());
        assert_ne!(id, RequestId::new_random());
    }

    #[test]
    fn plain_message_size_excludes_length_prefix() {
        let msg = Message::new(7, "hdr", "body");
        assert_eq!(msg.size(), 4 + 4 + 3 + 4 + 4);
        assert_eq!(msg.to_string(), "ID=7 HeadLen=3 DataLen=4");
    }
}
