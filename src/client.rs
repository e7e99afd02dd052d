// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A single-connection analogue of [`crate::server::Server`].
//!
//! `Client` adds one extra state in front of [`Connection`]'s own state
//! machine: `connecting`, for platforms where `connect()` on a
//! non-blocking socket returns `WouldBlock` and the handshake cannot
//! begin until a write-readiness event confirms the connection completed.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace, warn};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::codec::Codec;
use crate::connection::{self, Connection};
use crate::message::Message;

const CLIENT_TOKEN: Token = Token(0);

/// Failures from [`Client`] operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error<E: std::error::Error + 'static> {
    /// `connect` was called on an already-connecting or already-open client.
    #[error("client is already connecting or connected")]
    AlreadyConnecting,
    /// An operation that requires a live connection was attempted before one exists.
    #[error("client is not connected")]
    NotConnected,
    /// The connection's codec or transport failed.
    #[error("connection error")]
    Connection(#[from] connection::Error<E>),
    /// A syscall on the socket or readiness descriptor failed.
    #[error("i/o error")]
    Io(#[from] io::Error),
}

enum State<C: Codec, M: Message> {
    Idle,
    Connecting { socket: TcpStream, args: C::Args },
    Active(Connection<C, TcpStream, M>),
}

/// A single outbound connection driven by repeated [`Client::poll`] calls.
pub struct Client<C: Codec, M: Message> {
    poll: Poll,
    state: State<C, M>,
}

impl<C: Codec, M: Message> Client<C, M> {
    /// Creates an idle client with its own readiness-notification descriptor.
    pub fn new() -> io::Result<Self> {
        Ok(Client {
            poll: Poll::new()?,
            state: State::Idle,
        })
    }

    /// True once the handshake has completed and the connection is open.
    pub fn is_open(&self) -> bool {
        matches!(&self.state, State::Active(conn) if conn.is_open())
    }

    /// Connects to `addr` using a blocking socket, then hands the now
    /// fully-connected stream to [`Connection::connect`] directly in
    /// `init`. For platforms where TCP connect is synchronous.
    pub fn connect(&mut self, addr: SocketAddr, args: &C::Args) -> Result<(), Error<C::Error>> {
        if !matches!(self.state, State::Idle) {
            return Err(Error::AlreadyConnecting);
        }
        let std_stream = std::net::TcpStream::connect(addr)?;
        std_stream.set_nonblocking(true)?;
        let mut stream = TcpStream::from_std(std_stream);
        self.poll
            .registry()
            .register(&mut stream, CLIENT_TOKEN, Interest::READABLE | Interest::WRITABLE)?;
        let conn = Connection::connect(stream, args)?;
        trace!("connected to {} synchronously", addr);
        self.state = State::Active(conn);
        Ok(())
    }

    /// Begins a non-blocking connect to `addr`. The client enters
    /// `connecting` until a subsequent `poll` observes write-readiness.
    pub fn connect_nonblocking(&mut self, addr: SocketAddr, args: C::Args) -> Result<(), Error<C::Error>> {
        if !matches!(self.state, State::Idle) {
            return Err(Error::AlreadyConnecting);
        }
        let mut socket = TcpStream::connect(addr)?;
        self.poll
            .registry()
            .register(&mut socket, CLIENT_TOKEN, Interest::READABLE | Interest::WRITABLE)?;
        debug!("connecting to {} (non-blocking)", addr);
        self.state = State::Connecting { socket, args };
        Ok(())
    }

    /// Waits up to `wait_ms` for a readiness event and advances the client's
    /// state machine by exactly one step.
    pub fn poll(
        &mut self,
        on_open: &mut dyn FnMut(C::Result),
        on_message: &mut dyn FnMut(M),
        on_close: &mut dyn FnMut(),
        wait_ms: u64,
    ) -> Result<(), Error<C::Error>> {
        let mut events = Events::with_capacity(1);
        self.poll
            .poll(&mut events, Some(Duration::from_millis(wait_ms)))?;
        if events.iter().next().is_none() {
            return Ok(());
        }

        if let State::Connecting { .. } = &self.state {
            let (socket, args) = match std::mem::replace(&mut self.state, State::Idle) {
                State::Connecting { socket, args } => (socket, args),
                _ => unreachable!(),
            };
            match socket.take_error()? {
                Some(e) => {
                    warn!("non-blocking connect failed: {}", e);
                    return Err(Error::Io(e));
                }
                None => {
                    trace!("non-blocking connect completed");
                    let conn = Connection::connect(socket, &args)?;
                    self.state = State::Active(conn);
                }
            }
            return Ok(());
        }

        let conn = match &mut self.state {
            State::Active(conn) => conn,
            State::Idle => return Err(Error::NotConnected),
            State::Connecting { .. } => unreachable!("handled above"),
        };
        match conn.recv() {
            Ok(connection::Event::None) => {}
            Ok(connection::Event::Open(result)) => on_open(result),
            Ok(connection::Event::Message(message)) => on_message(message),
            Ok(connection::Event::Close) => {
                self.state = State::Idle;
                on_close();
            }
            Err(e) => {
                warn!("connection failed: {}", e);
                self.state = State::Idle;
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Sends one application message. Requires the connection to be open.
    pub fn send(&mut self, message: &M) -> Result<(), Error<C::Error>> {
        match &mut self.state {
            State::Active(conn) => Ok(conn.send(message)?),
            _ => Err(Error::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::coded::Coded;
    use crate::message::{Corrupted, Message};
    use crate::server::Server;

    const CODE: [u8; 16] = [3u8; 16];

    struct Ping(u8);

    impl Message for Ping {
        const LEN: usize = 1;

        fn to_bytes(&self, out: &mut [u8]) {
            out[0] = self.0;
        }

        fn from_bytes(bytes: &[u8]) -> Result<Self, Corrupted> {
            Ok(Ping(bytes[0]))
        }
    }

    #[test]
    fn connect_completes_handshake_and_exchanges_a_message() {
        let mut server: Server<Coded, Ping> = Server::new(4, 4).unwrap();
        server.listen(0, CODE).unwrap();
        let addr = server.local_addr().unwrap();

        let mut client: Client<Coded, Ping> = Client::new().unwrap();
        client.connect(addr, &CODE).unwrap();

        let mut server_handle = None;
        let mut client_opened = false;
        for _ in 0..20 {
            server
                .poll(
                    &mut |h, _| server_handle = Some(h),
                    &mut |_, _: Ping| {},
                    &mut |_| {},
                    8,
                    50,
                    5_000,
                )
                .unwrap();
            client
                .poll(&mut |_| client_opened = true, &mut |_: Ping| {}, &mut || {}, 50)
                .unwrap();
            if server_handle.is_some() && client_opened {
                break;
            }
        }
        let server_handle = server_handle.expect("server should have admitted the connection");
        assert!(client_opened);
        assert!(client.is_open());

        client.send(&Ping(7)).unwrap();
        let mut got = None;
        for _ in 0..20 {
            server
                .poll(
                    &mut |_, _| {},
                    &mut |h, m: Ping| got = Some((h, m.0)),
                    &mut |_| {},
                    8,
                    50,
                    5_000,
                )
                .unwrap();
            if got.is_some() {
                break;
            }
        }
        let (handle, value) = got.expect("server should have received the message");
        assert_eq!(handle, server_handle);
        assert_eq!(value, 7);
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut client: Client<Coded, Ping> = Client::new().unwrap();
        let mut server: Server<Coded, Ping> = Server::new(1, 1).unwrap();
        server.listen(0, CODE).unwrap();
        let addr = server.local_addr().unwrap();
        client.connect(addr, &CODE).unwrap();
        assert!(matches!(client.connect(addr, &CODE), Err(Error::AlreadyConnecting)));
    }

    #[test]
    fn send_before_connecting_is_an_error() {
        let mut client: Client<Coded, Ping> = Client::new().unwrap();
        assert!(matches!(client.send(&Ping(1)), Err(Error::NotConnected)));
    }
}
