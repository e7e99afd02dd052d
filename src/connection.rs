// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The per-socket protocol state machine.
//!
//! A `Connection` owns one socket, one codec instance, and either a
//! handshake buffer (while in `init`) or a framed message buffer (while
//! `open`). It never reallocates once constructed: both regions are sized
//! once from the codec's `MIN_HANDSHAKE_SPACE` and the message length `M`.

use std::io::{self, Read, Write};
use std::marker::PhantomData;

use log::{trace, warn};
use thiserror::Error;

use crate::buffer::{HandshakeBuffer, ProtocolBuffer};
use crate::codec::Codec;
use crate::message::Message;

/// Failures surfaced by [`Connection::recv`]/[`Connection::send`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error<E: std::error::Error + 'static> {
    /// A read or write syscall failed, or the peer sent a short message.
    #[error("i/o error")]
    Io(#[from] io::Error),
    /// The codec rejected a handshake step or a framed message.
    #[error("codec error")]
    Codec(#[source] E),
    /// `send` was called before the connection finished its handshake.
    #[error("connection is not open yet")]
    NotReady,
    /// An operation was attempted on an already-closed connection.
    #[error("connection is closed")]
    Closed,
}

/// One event produced by [`Connection::recv`].
pub enum Event<R, M> {
    /// More bytes are needed before the next event can be produced.
    None,
    /// The handshake completed; carries the codec's finalization value.
    Open(R),
    /// A complete application message was decoded.
    Message(M),
    /// The connection closed (peer EOF, short I/O, or an explicit close).
    Close,
}

enum State<C: Codec> {
    Init {
        buf: HandshakeBuffer,
        data: C::HandshakeData,
    },
    Open {
        codec: C,
        recv_buf: ProtocolBuffer,
        send_buf: ProtocolBuffer,
    },
    Closed,
}

/// A single socket driven through a codec's handshake and then through
/// fixed-size message framing.
pub struct Connection<C: Codec, S, M: Message> {
    socket: S,
    state: State<C>,
    _message: PhantomData<M>,
}

fn out_scratch_len<C: Codec, M: Message>() -> usize {
    C::MIN_HANDSHAKE_SPACE.max(C::header_out_len(M::LEN) + M::LEN)
}

/// The receive/send `ProtocolBuffer` pair for the `open` state, sized
/// independently by `header_in_len`/`header_out_len`: a codec's inbound
/// and outbound header regions need not be the same size (e.g.
/// `Websocket`'s 6/8-byte masked request header versus its 2/4-byte
/// unmasked response header).
fn open_buffers<C: Codec, M: Message>() -> (ProtocolBuffer, ProtocolBuffer) {
    (
        ProtocolBuffer::new(C::header_in_len(M::LEN), M::LEN),
        ProtocolBuffer::new(C::header_out_len(M::LEN), M::LEN),
    )
}

impl<C: Codec, S: Read + Write, M: Message> Connection<C, S, M> {
    fn new(socket: S, data: C::HandshakeData, first_read: usize) -> Self {
        let cap = first_read.max(C::MIN_HANDSHAKE_SPACE);
        let mut buf = HandshakeBuffer::new(cap);
        buf.resize(first_read);
        Connection {
            socket,
            state: State::Init { buf, data },
            _message: PhantomData,
        }
    }

    /// Builds a connection in `init` state as the accepting side.
    pub fn accept(socket: S, args: &C::Args) -> Self {
        let mut data = C::HandshakeData::default();
        let first_read = C::accept(&mut data, args);
        Connection::new(socket, data, first_read)
    }

    /// Builds a connection in `init` state as the initiating side, sending
    /// the first handshake chunk immediately.
    pub fn connect(mut socket: S, args: &C::Args) -> Result<Self, Error<C::Error>> {
        let mut data = C::HandshakeData::default();
        let mut out = vec![0u8; out_scratch_len::<C, M>()];
        let ev = C::connect(&mut data, &mut out, args).map_err(Error::Codec)?;
        if ev.out_len > 0 {
            socket.write_all(&out[..ev.out_len])?;
        }
        if ev.next_len == 0 {
            let codec = C::finish(data);
            let (recv_buf, send_buf) = open_buffers::<C, M>();
            return Ok(Connection {
                socket,
                state: State::Open { codec, recv_buf, send_buf },
                _message: PhantomData,
            });
        }
        Ok(Connection::new(socket, data, ev.next_len))
    }

    /// Mutable access to the underlying socket, for registering it with a
    /// readiness notifier before any bytes have been exchanged.
    pub(crate) fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// True once the handshake has completed.
    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    /// True once the connection has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    fn close(&mut self) {
        if !matches!(self.state, State::Closed) {
            trace!("closing connection");
            self.state = State::Closed;
        }
    }

    /// Sends one application message. Requires the connection to be `open`.
    pub fn send(&mut self, message: &M) -> Result<(), Error<C::Error>> {
        let (codec, buf) = match &mut self.state {
            State::Open { codec, send_buf, .. } => (codec, send_buf),
            State::Closed => return Err(Error::Closed),
            State::Init { .. } => return Err(Error::NotReady),
        };
        buf.clear();
        message.to_bytes(buf.body());
        codec.encode(buf.header(), buf.body());
        let whole_len = buf.whole().len();
        if let Err(e) = self
            .socket
            .write_all(&buf_whole(buf)[..whole_len])
        {
            self.close();
            return Err(Error::Io(e));
        }
        trace!("sent one message frame");
        Ok(())
    }

    /// Drives one readiness notification's worth of work and produces the
    /// resulting event.
    pub fn recv(&mut self) -> Result<Event<C::Result, M>, Error<C::Error>> {
        match &mut self.state {
            State::Closed => Ok(Event::Close),
            State::Init { .. } => self.recv_handshake(),
            State::Open { .. } => self.recv_message(),
        }
    }

    fn recv_handshake(&mut self) -> Result<Event<C::Result, M>, Error<C::Error>> {
        let n = {
            let buf = match &mut self.state {
                State::Init { buf, .. } => buf,
                _ => unreachable!(),
            };
            match self.socket.read(buf.read_slice()) {
                Ok(0) => {
                    self.close();
                    return Ok(Event::Close);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Event::None),
                Err(e) => {
                    self.close();
                    return Err(Error::Io(e));
                }
            }
        };

        let (buf, data) = match &mut self.state {
            State::Init { buf, data } => (buf, data),
            _ => unreachable!(),
        };
        buf.increment(n);

        let mut out = vec![0u8; out_scratch_len::<C, M>()];
        let step = match C::handshake(data, &mut out, buf.as_slice()) {
            Ok(Some(ev)) => ev,
            Ok(None) => return Ok(Event::None),
            Err(e) => {
                self.close();
                return Err(Error::Codec(e));
            }
        };

        if step.out_len > 0 {
            if let Err(e) = self.socket.write_all(&out[..step.out_len]) {
                self.close();
                return Err(Error::Io(e));
            }
        }

        if step.next_len == 0 {
            let data = match std::mem::replace(&mut self.state, State::Closed) {
                State::Init { data, .. } => data,
                _ => unreachable!(),
            };
            let result = C::result(&data);
            let codec = C::finish(data);
            let (recv_buf, send_buf) = open_buffers::<C, M>();
            self.state = State::Open { codec, recv_buf, send_buf };
            trace!("handshake complete, connection open");
            return Ok(Event::Open(result));
        }

        let buf = match &mut self.state {
            State::Init { buf, .. } => buf,
            _ => unreachable!(),
        };
        if step.rem_len > 0 {
            let consumed = buf.pos();
            let carry_start = consumed - step.rem_len;
            buf.as_mut_slice().copy_within(carry_start..consumed, 0);
            buf.resize(step.next_len);
            buf.seek(step.rem_len);
        } else {
            buf.resize(step.next_len);
            buf.seek(0);
        }
        Ok(Event::None)
    }

    fn recv_message(&mut self) -> Result<Event<C::Result, M>, Error<C::Error>> {
        {
            let buf = match &mut self.state {
                State::Open { recv_buf, .. } => recv_buf,
                _ => unreachable!(),
            };
            if buf.full() {
                buf.clear();
            }
        }
        let n = {
            let buf = match &mut self.state {
                State::Open { recv_buf, .. } => recv_buf,
                _ => unreachable!(),
            };
            match self.socket.read(buf.read_slice()) {
                Ok(0) => {
                    self.close();
                    return Ok(Event::Close);
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Event::None),
                Err(e) => {
                    self.close();
                    return Err(Error::Io(e));
                }
            }
        };
        let (codec, buf) = match &mut self.state {
            State::Open { codec, recv_buf, .. } => (codec, recv_buf),
            _ => unreachable!(),
        };
        buf.increment(n);
        if !buf.full() {
            return Ok(Event::None);
        }

        // Decode/deserialize failures are logged and the frame is dropped,
        // but the connection stays open: the transport itself is still
        // healthy. The buffer is left full; `full()` clears it before the
        // next read picks up the following frame.
        let header_len = buf.header().len();
        let (header, body) = buf_whole(buf).split_at_mut(header_len);
        if let Err(e) = codec.decode(header, body) {
            warn!("dropping frame that failed to decode: {}", e);
            return Ok(Event::None);
        }
        let message = match M::from_bytes(body) {
            Ok(m) => m,
            Err(_) => {
                warn!("dropping frame that failed to deserialize");
                return Ok(Event::None);
            }
        };
        trace!("decoded one message frame");
        Ok(Event::Message(message))
    }
}

fn buf_whole(buf: &mut ProtocolBuffer) -> &mut [u8] {
    buf.whole()
}
