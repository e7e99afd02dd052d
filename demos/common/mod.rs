// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Shared fixed-layout message type for the demo binaries. Not part of the
//! library surface: applications supply their own [`stagehand::Message`].

use stagehand::message::{Corrupted, Message};

/// Convenience alias for demo `main` functions.
pub type BoxedError = Box<dyn std::error::Error>;

const CAPACITY: usize = 63;

/// A short UTF-8 chat line, serialized as one length byte followed by
/// `CAPACITY` bytes of (zero-padded) text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        ChatMessage { text: text.into() }
    }
}

impl Message for ChatMessage {
    const LEN: usize = 1 + CAPACITY;

    fn to_bytes(&self, out: &mut [u8]) {
        let bytes = self.text.as_bytes();
        let len = bytes.len().min(CAPACITY);
        out[0] = len as u8;
        out[1..1 + len].copy_from_slice(&bytes[..len]);
        out[1 + len..].fill(0);
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, Corrupted> {
        let len = bytes[0] as usize;
        if len > CAPACITY {
            return Err(Corrupted);
        }
        let text = std::str::from_utf8(&bytes[1..1 + len])
            .map_err(|_| Corrupted)?
            .to_owned();
        Ok(ChatMessage { text })
    }
}
