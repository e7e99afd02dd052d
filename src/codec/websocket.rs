// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! `Websocket`: a server-only RFC 6455 upgrade plus single-frame binary framing.
//!
//! Only the acceptor role is implemented; this codec's natural use as an
//! initiator is inside [`crate::codec::websockify::Websockify`], which
//! treats the WS phase as trivially complete on the connect side (see the
//! composition note in `SPEC_FULL.md` §4.3.4).

use sha1::{Digest, Sha1};
use thiserror::Error;

use super::{Codec, HandshakeEvent};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_NUM_HEADERS: usize = 32;
const INITIAL_READ: usize = 512;
const MIN_HANDSHAKE_SPACE: usize = 8192;
const SEC_WEBSOCKET_KEY_LEN: usize = 24;

/// `Websocket` handshake/framing failures.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The request could not be parsed as HTTP/1.1.
    #[error("malformed HTTP request")]
    InvalidRequest,
    /// The HTTP version was not 1.1.
    #[error("unsupported HTTP version")]
    InvalidVersion,
    /// `Upgrade` header was missing or not `websocket`.
    #[error("missing or invalid Upgrade header")]
    InvalidUpgrade,
    /// `Connection` header was missing or did not contain `upgrade`.
    #[error("missing or invalid Connection header")]
    InvalidConnection,
    /// `Sec-WebSocket-Key` was missing or the wrong length.
    #[error("missing or invalid Sec-WebSocket-Key header")]
    InvalidKey,
    /// One or more required header lines were never seen.
    #[error("required header line missing")]
    MissingLine,
    /// The frame's length field did not match the expected message size.
    #[error("frame length field did not match the expected message size")]
    FrameLengthInvalid,
    /// The frame declared a 64-bit extended length, which this codec rejects.
    #[error("frame length too long")]
    FrameLengthTooLong,
    /// The frame was not masked (required for client-to-server frames).
    #[error("frame was not masked")]
    NotMasked,
    /// A reserved bit was set.
    #[error("reserved bit set")]
    ReservedBitSet,
    /// The frame's FIN bit was clear (fragmented messages are unsupported).
    #[error("fragmented (multi-frame) message")]
    MultiFrameMessage,
    /// The frame's opcode was not binary (0x2).
    #[error("frame opcode was not binary")]
    OpcodeNotBinary,
    /// This codec only implements the acceptor role.
    #[error("client role is not supported by this codec")]
    ClientRoleUnsupported,
}

/// `Websocket` carries no state across the single upgrade step.
#[derive(Debug, Default)]
pub struct HandshakeData;

/// Server-side WebSocket upgrade + single-fragment binary framing.
#[derive(Debug, Default)]
pub struct Websocket;

fn header_eq_ignore_ascii_case(value: &[u8], expect: &str) -> bool {
    value.eq_ignore_ascii_case(expect.as_bytes())
}

fn header_contains_ignore_ascii_case(value: &[u8], needle: &str) -> bool {
    let value = match std::str::from_utf8(value) {
        Ok(v) => v.to_ascii_lowercase(),
        Err(_) => return false,
    };
    value.contains(&needle.to_ascii_lowercase())
}

fn accept_key(client_key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key);
    hasher.update(GUID);
    let digest = hasher.finalize();
    base64::encode(digest)
}

impl Codec for Websocket {
    type HandshakeData = HandshakeData;
    type Args = ();
    type Result = ();
    type Error = Error;

    const MIN_HANDSHAKE_SPACE: usize = MIN_HANDSHAKE_SPACE;

    fn accept(_data: &mut Self::HandshakeData, _args: &Self::Args) -> usize {
        INITIAL_READ
    }

    fn connect(
        _data: &mut Self::HandshakeData,
        _out: &mut [u8],
        _args: &Self::Args,
    ) -> Result<HandshakeEvent, Self::Error> {
        Err(Error::ClientRoleUnsupported)
    }

    fn handshake(
        _data: &mut Self::HandshakeData,
        out: &mut [u8],
        input: &[u8],
    ) -> Result<Option<HandshakeEvent>, Self::Error> {
        let mut header_buf = [httparse::EMPTY_HEADER; MAX_NUM_HEADERS];
        let mut req = httparse::Request::new(&mut header_buf);
        let status = req.parse(input).map_err(|_| Error::InvalidRequest)?;
        if status.is_partial() {
            if input.len() >= MIN_HANDSHAKE_SPACE {
                return Err(Error::MissingLine);
            }
            let next_len = (input.len() * 2).clamp(INITIAL_READ, MIN_HANDSHAKE_SPACE);
            return Ok(Some(HandshakeEvent {
                out_len: 0,
                next_len,
                rem_len: input.len(),
            }));
        }

        if req.version != Some(1) {
            return Err(Error::InvalidVersion);
        }

        let mut has_upgrade = false;
        let mut has_connection = false;
        let mut has_version = false;
        let mut client_key: Option<[u8; SEC_WEBSOCKET_KEY_LEN]> = None;

        for header in req.headers.iter() {
            if header_eq_ignore_ascii_case(header.name.as_bytes(), "upgrade") {
                if header_eq_ignore_ascii_case(header.value, "websocket") {
                    has_upgrade = true;
                } else {
                    return Err(Error::InvalidUpgrade);
                }
            } else if header_eq_ignore_ascii_case(header.name.as_bytes(), "connection") {
                if header_contains_ignore_ascii_case(header.value, "upgrade") {
                    has_connection = true;
                } else {
                    return Err(Error::InvalidConnection);
                }
            } else if header_eq_ignore_ascii_case(header.name.as_bytes(), "sec-websocket-version") {
                has_version = header.value == b"13";
            } else if header_eq_ignore_ascii_case(header.name.as_bytes(), "sec-websocket-key") {
                if header.value.len() != SEC_WEBSOCKET_KEY_LEN {
                    return Err(Error::InvalidKey);
                }
                let mut key = [0u8; SEC_WEBSOCKET_KEY_LEN];
                key.copy_from_slice(header.value);
                client_key = Some(key);
            }
        }

        let client_key = client_key.ok_or(Error::InvalidKey)?;
        if !(has_upgrade && has_connection && has_version) {
            return Err(Error::MissingLine);
        }

        let accept = accept_key(&client_key);
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept
        );
        let bytes = response.as_bytes();
        out[..bytes.len()].copy_from_slice(bytes);

        Ok(Some(HandshakeEvent {
            out_len: bytes.len(),
            next_len: 0,
            rem_len: 0,
        }))
    }

    fn result(_data: &Self::HandshakeData) -> Self::Result {}

    fn finish(_data: Self::HandshakeData) -> Self {
        Websocket
    }

    fn header_in_len(m: usize) -> usize {
        if m <= 125 {
            6
        } else {
            8
        }
    }

    fn header_out_len(m: usize) -> usize {
        if m <= 125 {
            2
        } else {
            4
        }
    }

    fn encode(&mut self, header: &mut [u8], body: &mut [u8]) {
        let m = body.len();
        header[0] = 0x82; // FIN=1, opcode=binary
        if m <= 125 {
            header[1] = m as u8;
        } else {
            header[1] = 126;
            header[2..4].copy_from_slice(&(m as u16).to_be_bytes());
        }
    }

    fn decode(&mut self, header: &[u8], body: &mut [u8]) -> Result<(), Self::Error> {
        let byte0 = header[0];
        if byte0 & 0x80 == 0 {
            return Err(Error::MultiFrameMessage);
        }
        if byte0 & 0x70 != 0 {
            return Err(Error::ReservedBitSet);
        }
        if byte0 & 0x0F != 0x2 {
            return Err(Error::OpcodeNotBinary);
        }

        let byte1 = header[1];
        if byte1 & 0x80 == 0 {
            return Err(Error::NotMasked);
        }
        let len_field = byte1 & 0x7F;

        let mask_offset = if body.len() <= 125 {
            if len_field as usize != body.len() {
                return Err(Error::FrameLengthInvalid);
            }
            2
        } else if body.len() <= 65535 {
            if len_field != 126 {
                return Err(Error::FrameLengthInvalid);
            }
            let ext = u16::from_be_bytes([header[2], header[3]]) as usize;
            if ext != body.len() {
                return Err(Error::FrameLengthInvalid);
            }
            4
        } else {
            return Err(Error::FrameLengthTooLong);
        };

        let mask = [
            header[mask_offset],
            header[mask_offset + 1],
            header[mask_offset + 2],
            header[mask_offset + 3],
        ];
        for (i, b) in body.iter_mut().enumerate() {
            *b ^= mask[i % 4];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const EXPECTED_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

    #[test]
    fn accept_key_matches_rfc6455_example() {
        assert_eq!(accept_key(SAMPLE_KEY.as_bytes()), EXPECTED_ACCEPT);
    }

    #[test]
    fn full_request_produces_switching_protocols_response() {
        let request = format!(
            "GET /chat HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            SAMPLE_KEY
        );
        let mut data = HandshakeData;
        let mut out = [0u8; 256];
        let ev = Websocket::handshake(&mut data, &mut out, request.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.next_len, 0);
        let response = std::str::from_utf8(&out[..ev.out_len]).unwrap();
        assert!(response.contains(EXPECTED_ACCEPT));
        assert!(response.starts_with("HTTP/1.1 101"));
    }

    #[test]
    fn partial_request_carries_over_without_consuming() {
        let mut data = HandshakeData;
        let mut out = [0u8; 256];
        let partial = b"GET /chat HTTP/1.1\r\nHost: example.com\r\n";
        let ev = Websocket::handshake(&mut data, &mut out, partial)
            .unwrap()
            .unwrap();
        assert_eq!(ev.out_len, 0);
        assert_eq!(ev.rem_len, partial.len());
        assert!(ev.next_len > partial.len());
    }

    #[test]
    fn missing_required_header_is_rejected() {
        let request = "GET /chat HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut data = HandshakeData;
        let mut out = [0u8; 256];
        assert_eq!(
            Websocket::handshake(&mut data, &mut out, request.as_bytes()),
            Err(Error::MissingLine)
        );
    }

    #[test]
    fn encode_decode_roundtrip_for_small_and_extended_lengths() {
        let mut codec = Websocket::default();

        let mut header = [0u8; 2];
        let mut body = [1u8, 2, 3];
        codec.encode(&mut header, &mut body);
        assert_eq!(header, [0x82, 3]);

        let m = 200;
        let mut header = [0u8; 4];
        let mut body = vec![0u8; m];
        codec.encode(&mut header, &mut body);
        assert_eq!(header[0], 0x82);
        assert_eq!(header[1], 126);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), m as u16);
    }

    #[test]
    fn decode_unmasks_client_frame_and_rejects_bad_opcode() {
        let mut codec = Websocket::default();
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let plaintext = [1u8, 2, 3];
        let mut header = [0u8; 6];
        header[0] = 0x82;
        header[1] = 0x80 | 3;
        header[2..6].copy_from_slice(&mask);
        let mut body: Vec<u8> = plaintext
            .iter()
            .enumerate()
            .map(|(i, b)| b ^ mask[i % 4])
            .collect();
        codec.decode(&header, &mut body).unwrap();
        assert_eq!(body, plaintext);

        header[0] = 0x81; // opcode text, not binary
        let mut body2 = vec![0u8; 3];
        assert_eq!(
            codec.decode(&header, &mut body2),
            Err(Error::OpcodeNotBinary)
        );
    }
}
