// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! `Websockify<Inner>`: wraps an inner handshake protocol inside WebSocket
//! binary frames.
//!
//! Every inner handshake message and every inner data frame is tunneled
//! inside exactly one WS binary frame. See `SPEC_FULL.md` §4.3.4 for the
//! composition rules, including the resolution of Open Question 1 (the
//! initiator path, which this codec's `Websocket` half never exercises
//! for real since it only implements the acceptor role).
//!
//! `Inner::Args` must be `Clone`: unlike `accept`/`connect`'s other
//! codecs, which consume `args` entirely within that single call, this
//! composition needs to replay `args` into `Inner::accept`/`Inner::connect`
//! later, once the WS phase completes. This rules out wrapping a codec
//! whose `Args` cannot be cloned (e.g. `Ae`, whose `Keypair` is
//! intentionally non-`Clone`); see DESIGN.md.

use thiserror::Error;

use super::websocket::{self, Websocket};
use super::{Codec, HandshakeEvent};

/// Errors from either half of the composition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error<E: std::error::Error + 'static> {
    /// The WebSocket upgrade failed.
    #[error("websocket upgrade failed: {0}")]
    Ws(#[source] websocket::Error),
    /// The tunneled inner protocol failed.
    #[error("inner protocol failed: {0}")]
    Inner(#[source] E),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Stage {
    Ws,
    Inner,
}

/// Per-connection state: the WS upgrade scratch, the saved `Inner::Args`,
/// and (once the WS phase hands off) the inner codec's own handshake data.
pub struct HandshakeData<Inner: Codec> {
    stage: Stage,
    ws: websocket::HandshakeData,
    args: Option<Inner::Args>,
    inner: Option<Inner::HandshakeData>,
}

impl<Inner: Codec> Default for HandshakeData<Inner> {
    fn default() -> Self {
        HandshakeData {
            stage: Stage::Ws,
            ws: websocket::HandshakeData::default(),
            args: None,
            inner: None,
        }
    }
}

/// Composes [`Websocket`] over `Inner`.
pub struct Websockify<Inner> {
    ws: Websocket,
    inner: Inner,
}

impl<Inner: Default> Default for Websockify<Inner> {
    fn default() -> Self {
        Websockify {
            ws: Websocket::default(),
            inner: Inner::default(),
        }
    }
}

/// Reads just enough of a WS frame header to learn the frame's total wire
/// length (header + masked payload), without touching the payload itself.
/// Returns `None` until the whole 6-byte (or, for extended lengths,
/// 8-byte) header has arrived.
fn peek_ws_frame_len(input: &[u8]) -> Option<usize> {
    if input.len() < 2 {
        return None;
    }
    let len_field = input[1] & 0x7F;
    let header_len = if len_field <= 125 { 6 } else { 8 };
    if input.len() < header_len {
        return None;
    }
    let body_len = if len_field <= 125 {
        len_field as usize
    } else {
        u16::from_be_bytes([input[2], input[3]]) as usize
    };
    Some(header_len + body_len)
}

/// Frames `body` (already written into `out` starting at `prefix`) with a
/// WS binary header, shifting `body` left if the reserved `prefix` turned
/// out larger than the header this payload actually needs. Returns the
/// total number of bytes written at the front of `out`.
fn ws_frame(out: &mut [u8], prefix: usize, body_len: usize) -> usize {
    let needed = Websocket::header_out_len(body_len);
    if needed < prefix {
        out.copy_within(prefix..prefix + body_len, needed);
    }
    let (header, rest) = out.split_at_mut(needed);
    Websocket::default().encode(header, &mut rest[..body_len]);
    needed + body_len
}

impl<Inner: Codec> Codec for Websockify<Inner>
where
    Inner::Args: Clone,
{
    type HandshakeData = HandshakeData<Inner>;
    type Args = Inner::Args;
    type Result = Inner::Result;
    type Error = Error<Inner::Error>;

    const MIN_HANDSHAKE_SPACE: usize = {
        if Websocket::MIN_HANDSHAKE_SPACE > Inner::MIN_HANDSHAKE_SPACE {
            Websocket::MIN_HANDSHAKE_SPACE
        } else {
            Inner::MIN_HANDSHAKE_SPACE
        }
    };

    fn accept(data: &mut Self::HandshakeData, args: &Self::Args) -> usize {
        data.args = Some(args.clone());
        data.stage = Stage::Ws;
        Websocket::accept(&mut data.ws, &())
    }

    fn connect(
        data: &mut Self::HandshakeData,
        out: &mut [u8],
        args: &Self::Args,
    ) -> Result<HandshakeEvent, Self::Error> {
        // The WS phase has nothing to send on the initiator side (this
        // crate's `Websocket` codec performs only the server half of the
        // upgrade): treat it as immediately satisfied and go straight into
        // `Inner::connect`, WS-framing its output.
        data.args = Some(args.clone());
        data.stage = Stage::Inner;
        let mut inner_data = Inner::HandshakeData::default();
        let prefix = Websocket::header_out_len(out.len());
        let ev = Inner::connect(&mut inner_data, &mut out[prefix..], args).map_err(Error::Inner)?;
        let total = ws_frame(out, prefix, ev.out_len);
        data.inner = Some(inner_data);
        Ok(HandshakeEvent {
            out_len: total,
            next_len: Inner::header_in_len(0).max(ev.next_len),
            rem_len: 0,
        })
    }

    fn handshake(
        data: &mut Self::HandshakeData,
        out: &mut [u8],
        input: &[u8],
    ) -> Result<Option<HandshakeEvent>, Self::Error> {
        match data.stage {
            Stage::Ws => {
                let ev = match Websocket::handshake(&mut data.ws, out, input).map_err(Error::Ws)? {
                    Some(ev) => ev,
                    None => return Ok(None),
                };
                if ev.next_len != 0 {
                    // still mid-upgrade (buffer-full carry-over case)
                    return Ok(Some(ev));
                }
                // WS upgrade response has been written into `out`; switch
                // to the inner protocol for the next inbound chunk.
                data.stage = Stage::Inner;
                let mut inner_data = Inner::HandshakeData::default();
                let args = data.args.as_ref().expect("accept/connect always sets args");
                let inner_next = Inner::accept(&mut inner_data, args);
                data.inner = Some(inner_data);
                Ok(Some(HandshakeEvent {
                    out_len: ev.out_len,
                    next_len: Websocket::header_in_len(inner_next) + inner_next,
                    rem_len: ev.rem_len,
                }))
            }
            Stage::Inner => {
                let inner_data = data.inner.as_mut().expect("stage is Inner only once set");
                // Peek the WS length field before assuming the inbound
                // chunk is a complete frame: a short read can easily land
                // with enough bytes for the header but not the full
                // payload, and decoding a truncated body against the
                // frame's declared length would fail spuriously.
                let total_len = match peek_ws_frame_len(input) {
                    Some(total) => total,
                    None => {
                        return Ok(Some(HandshakeEvent {
                            out_len: 0,
                            next_len: 8,
                            rem_len: input.len(),
                        }))
                    }
                };
                if input.len() < total_len {
                    return Ok(Some(HandshakeEvent {
                        out_len: 0,
                        next_len: total_len,
                        rem_len: input.len(),
                    }));
                }

                let header_len = if (input[1] & 0x7F) <= 125 { 6 } else { 8 };
                let (header, body) = input.split_at(header_len);
                let mut body = body[..total_len - header_len].to_vec();
                Websocket::default()
                    .decode(header, &mut body)
                    .map_err(Error::Ws)?;

                let mut inner_out = vec![0u8; out.len()];
                let ev = match Inner::handshake(inner_data, &mut inner_out, &body).map_err(Error::Inner)? {
                    Some(ev) => ev,
                    None => return Ok(None),
                };

                if ev.out_len == 0 {
                    return Ok(Some(ev));
                }
                let prefix = Websocket::header_out_len(ev.out_len);
                out[prefix..prefix + ev.out_len].copy_from_slice(&inner_out[..ev.out_len]);
                let total = ws_frame(out, prefix, ev.out_len);
                Ok(Some(HandshakeEvent {
                    out_len: total,
                    next_len: if ev.next_len == 0 {
                        0
                    } else {
                        Websocket::header_in_len(ev.next_len) + ev.next_len
                    },
                    rem_len: ev.rem_len,
                }))
            }
        }
    }

    fn result(data: &Self::HandshakeData) -> Self::Result {
        Inner::result(
            data.inner
                .as_ref()
                .expect("result is only read once the inner handshake has run"),
        )
    }

    fn finish(data: Self::HandshakeData) -> Self {
        Websockify {
            ws: Websocket,
            inner: Inner::finish(data.inner.expect("finish runs after the inner handshake completes")),
        }
    }

    fn header_in_len(m: usize) -> usize {
        let inner = Inner::header_in_len(m);
        Websocket::header_in_len(m + inner) + inner
    }

    fn header_out_len(m: usize) -> usize {
        let inner = Inner::header_out_len(m);
        Websocket::header_out_len(m + inner) + inner
    }

    fn encode(&mut self, header: &mut [u8], body: &mut [u8]) {
        let inner_header_len = Inner::header_out_len(body.len());
        let ws_header_len = header.len() - inner_header_len;
        let (ws_header, inner_header) = header.split_at_mut(ws_header_len);
        self.inner.encode(inner_header, body);
        self.ws.encode(ws_header, body);
    }

    fn decode(&mut self, header: &[u8], body: &mut [u8]) -> Result<(), Self::Error> {
        let inner_header_len = Inner::header_in_len(body.len());
        let ws_header_len = header.len() - inner_header_len;
        let (ws_header, inner_header) = header.split_at(ws_header_len);
        self.ws.decode(ws_header, body).map_err(Error::Ws)?;
        self.inner.decode(inner_header, body).map_err(Error::Inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::coded::Coded;

    #[test]
    fn header_lengths_compose() {
        let small = Websockify::<Coded>::header_in_len(10);
        assert_eq!(small, Websocket::header_in_len(10 + 0) + 0);
        let out = Websockify::<Coded>::header_out_len(10);
        assert_eq!(out, Websocket::header_out_len(10 + 0) + 0);
    }

    fn masked_ws_frame(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0x82u8, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[test]
    fn partial_inner_frame_carries_over_instead_of_erroring() {
        let code = [4u8; 16];
        let mut data = HandshakeData::<Coded>::default();
        Websockify::<Coded>::accept(&mut data, &code);

        let request = "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n";
        let mut out = vec![0u8; 256];
        let ev = Websockify::<Coded>::handshake(&mut data, &mut out, request.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(ev.next_len, 22); // 6-byte WS header + 16-byte code

        let frame = masked_ws_frame(&code, [0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(frame.len(), 22);

        // Feed the frame one byte at a time: every prefix shorter than the
        // full frame must carry over rather than fail to decode.
        for n in 1..frame.len() {
            let mut out = vec![0u8; 256];
            let ev = Websockify::<Coded>::handshake(&mut data, &mut out, &frame[..n])
                .unwrap()
                .unwrap();
            assert_eq!(ev.out_len, 0, "no output until the full frame arrives");
            assert_eq!(ev.rem_len, n, "every byte read so far must be carried over");
            assert!(ev.next_len > n, "must ask for more bytes than currently available");
        }

        let mut out = vec![0u8; 256];
        let ev = Websockify::<Coded>::handshake(&mut data, &mut out, &frame)
            .unwrap()
            .unwrap();
        assert_eq!(ev.next_len, 0, "full frame completes the inner handshake");
        assert!(ev.out_len > 0, "acceptor echoes the code back");
    }

    #[test]
    fn encode_decode_roundtrip_over_coded_inner() {
        let mut codec = Websockify::<Coded> {
            ws: Websocket,
            inner: Coded,
        };
        let m = 5;
        let hdr_len = Websockify::<Coded>::header_out_len(m);
        let mut header = vec![0u8; hdr_len];
        let mut body = vec![1, 2, 3, 4, 5];
        codec.encode(&mut header, &mut body);
        assert_eq!(&header[..2], &[0x82, m as u8]);
    }
}
