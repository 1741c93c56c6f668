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

use std::io;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingSetupError(String),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("operation timed out: {0}")]
    Timeout(String),

    /// framing errors, fatal to the connection
    #[error("message too large: {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("truncated frame: {0}")]
    Truncated(String),

    /// stream-level closes, expected during normal teardown
    #[error("connection closed by peer")]
    PeerClosed,

    #[error("connection closed locally")]
    LocalClosed,
}

impl AppError {
    /// Errors raised by the envelope codec. The stream position is unknown
    /// after one of these, so the connection must be dropped.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            AppError::MessageTooLarge { .. } | AppError::MalformedFrame(_) | AppError::Truncated(_)
        )
    }

    pub fn is_closed(&self) -> bool {
        match self {
            AppError::PeerClosed | AppError::LocalClosed => true,
            AppError::IoError(err) => is_disconnect(err),
            _ => false,
        }
    }
}

pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_are_classified() {
        assert!(AppError::MessageTooLarge { size: 10, max: 5 }.is_framing());
        assert!(AppError::Truncated("body".into()).is_framing());
        assert!(AppError::MalformedFrame("length".into()).is_framing());
        assert!(!AppError::PeerClosed.is_framing());
    }

    #[test]
    fn reset_counts_as_closed() {
        let reset = AppError::IoError(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_closed());
        assert!(AppError::LocalClosed.is_closed());
        assert!(!AppError::Timeout("write".into()).is_closed());
    }

    #[test]
    fn too_large_message_display() {
        let err = AppError::MessageTooLarge { size: 3, max: 2 };
        assert_eq!(
            err.to_string(),
            "message too large: 3 bytes exceeds the limit of 2 bytes"
        );
    }
}
