// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! `Coded`: a plain 16-byte shared-code handshake.
//!
//! Both sides exchange the same 16-byte value. No framing header, no
//! encryption; useful for trusted transports or as the inner protocol of
//! a [`crate::codec::websockify::Websockify`].

use thiserror::Error;

use super::{Codec, HandshakeEvent};

const CODE_LEN: usize = 16;

/// `Coded` handshake/decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The peer's code did not match ours.
    #[error("peer presented the wrong code")]
    WrongCode,
}

/// Per-connection state for the `Coded` handshake.
pub struct HandshakeData {
    code: [u8; CODE_LEN],
    sent: bool,
}

impl Default for HandshakeData {
    fn default() -> Self {
        HandshakeData {
            code: [0u8; CODE_LEN],
            sent: false,
        }
    }
}

/// The plain shared-code codec. Carries no per-frame state once open.
#[derive(Default)]
pub struct Coded;

impl Codec for Coded {
    type HandshakeData = HandshakeData;
    type Args = [u8; CODE_LEN];
    type Result = ();
    type Error = Error;

    const MIN_HANDSHAKE_SPACE: usize = CODE_LEN;

    fn accept(data: &mut Self::HandshakeData, args: &Self::Args) -> usize {
        data.code = *args;
        CODE_LEN
    }

    fn connect(
        data: &mut Self::HandshakeData,
        out: &mut [u8],
        args: &Self::Args,
    ) -> Result<HandshakeEvent, Self::Error> {
        data.code = *args;
        out[..CODE_LEN].copy_from_slice(args);
        data.sent = true;
        Ok(HandshakeEvent {
            out_len: CODE_LEN,
            next_len: CODE_LEN,
            rem_len: 0,
        })
    }

    fn handshake(
        data: &mut Self::HandshakeData,
        out: &mut [u8],
        input: &[u8],
    ) -> Result<Option<HandshakeEvent>, Self::Error> {
        if input.len() < CODE_LEN {
            return Ok(None);
        }
        if input[..CODE_LEN] != data.code[..] {
            return Err(Error::WrongCode);
        }
        if !data.sent {
            data.sent = true;
            out[..CODE_LEN].copy_from_slice(&data.code);
            return Ok(Some(HandshakeEvent {
                out_len: CODE_LEN,
                next_len: 0,
                rem_len: 0,
            }));
        }
        Ok(Some(HandshakeEvent::done()))
    }

    fn result(_data: &Self::HandshakeData) -> Self::Result {}

    fn finish(_data: Self::HandshakeData) -> Self {
        Coded
    }

    fn header_in_len(_m: usize) -> usize {
        0
    }

    fn header_out_len(_m: usize) -> usize {
        0
    }

    fn encode(&mut self, _header: &mut [u8], _body: &mut [u8]) {}

    fn decode(&mut self, _header: &[u8], _body: &mut [u8]) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_codes_complete_the_handshake() {
        let code = [7u8; CODE_LEN];
        let mut acceptor = HandshakeData::default();
        Coded::accept(&mut acceptor, &code);
        let mut initiator = HandshakeData::default();
        let mut init_out = [0u8; CODE_LEN];
        let ev = Coded::connect(&mut initiator, &mut init_out, &code).unwrap();
        assert_eq!(ev.out_len, CODE_LEN);

        let mut acc_out = [0u8; CODE_LEN];
        let ev = Coded::handshake(&mut acceptor, &mut acc_out, &init_out)
            .unwrap()
            .unwrap();
        assert_eq!(ev.next_len, 0);
        assert_eq!(&acc_out[..], &code[..]);

        let ev = Coded::handshake(&mut initiator, &mut [0u8; 0], &acc_out)
            .unwrap()
            .unwrap();
        assert_eq!(ev.next_len, 0);
    }

    #[test]
    fn mismatched_code_is_rejected() {
        let mut acceptor = HandshakeData::default();
        Coded::accept(&mut acceptor, &[1u8; CODE_LEN]);
        let wrong = [2u8; CODE_LEN];
        let mut out = [0u8; CODE_LEN];
        assert_eq!(
            Coded::handshake(&mut acceptor, &mut out, &wrong),
            Err(Error::WrongCode)
        );
    }

    #[test]
    fn partial_read_requests_more_bytes() {
        let mut acceptor = HandshakeData::default();
        Coded::accept(&mut acceptor, &[1u8; CODE_LEN]);
        let mut out = [0u8; CODE_LEN];
        assert_eq!(
            Coded::handshake(&mut acceptor, &mut out, &[1u8; 4]).unwrap(),
            None
        );
    }
}
