// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A single-threaded, fixed-capacity connection server.
//!
//! `Server` owns a listening socket, a pool of [`Connection`]s, a fixed
//! table of handshake timers, and one `mio` readiness-notification
//! descriptor. Nothing here spawns a thread or takes a lock: the whole
//! loop is driven by repeated calls to [`Server::poll`].

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

use crate::codec::Codec;
use crate::connection::{self, Connection};
use crate::message::Message;
use crate::pool::{self, Pool};

/// The sentinel token identifying readiness events on the listening socket.
const LISTENER_TOKEN: Token = Token(usize::MAX);

/// A stable reference to one connection in the server's pool.
pub type Handle = usize;

/// Failures from [`Server`] admission and send operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error<E: std::error::Error + 'static> {
    /// `listen` was called while already listening.
    #[error("server is already listening")]
    AlreadyListening,
    /// `connect`/`accept` on the listening socket were attempted before `listen`.
    #[error("server is not listening")]
    NotListening,
    /// `send` referenced a handle with no live connection.
    #[error("no connection for that handle")]
    InvalidHandle,
    /// No free slot remained in the handshake-timer table.
    #[error("handshake timer table is full")]
    HandshakeQueueFull,
    /// The connection pool has no free slot.
    #[error("connection pool is out of space")]
    OutOfSpace(#[from] pool::Error),
    /// The connection's codec or transport failed.
    #[error("connection error")]
    Connection(#[from] connection::Error<E>),
    /// A syscall on the listening or readiness descriptor failed.
    #[error("i/o error")]
    Io(#[from] io::Error),
}

struct HandshakeTimer {
    handle: Handle,
    admitted_at: Instant,
}

/// A single-threaded server multiplexing many connections through one
/// codec and message type.
pub struct Server<C: Codec, M: Message> {
    poll: Poll,
    listener: Option<TcpListener>,
    args: Option<C::Args>,
    timers: Vec<Option<HandshakeTimer>>,
    conns: Pool<Connection<C, TcpStream, M>>,
}

impl<C: Codec, M: Message> Server<C, M>
where
    C::Args: Clone,
{
    /// Creates a server with room for `max_conns` connections and
    /// `max_active_handshakes` concurrent in-flight handshakes.
    pub fn new(max_conns: usize, max_active_handshakes: usize) -> io::Result<Self> {
        let mut timers = Vec::with_capacity(max_active_handshakes);
        timers.resize_with(max_active_handshakes, || None);
        Ok(Server {
            poll: Poll::new()?,
            listener: None,
            args: None,
            timers,
            conns: Pool::new(max_conns),
        })
    }

    /// Binds and starts listening on `0.0.0.0:port`, registering it under
    /// the sentinel readiness token.
    pub fn listen(&mut self, port: u16, args: C::Args) -> Result<(), Error<C::Error>> {
        if self.listener.is_some() {
            return Err(Error::AlreadyListening);
        }
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let mut listener = TcpListener::bind(addr)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        self.listener = Some(listener);
        self.args = Some(args);
        debug!("listening on {}", addr);
        Ok(())
    }

    /// Synchronously connects out to `addr`, admitting the resulting socket
    /// as an initiating connection.
    pub fn connect(&mut self, addr: SocketAddr, args: &C::Args) -> Result<Handle, Error<C::Error>> {
        let stream = TcpStream::connect(addr)?;
        let conn = Connection::connect(stream, args)?;
        self.admit(conn)
    }

    /// Finds a free handshake-timer slot for `handle`, or fails the
    /// admission if the table is already full.
    fn reserve_timer_slot(&mut self, handle: Handle) -> Result<(), Error<C::Error>> {
        let slot = self
            .timers
            .iter()
            .position(|t| t.is_none())
            .ok_or(Error::HandshakeQueueFull)?;
        self.timers[slot] = Some(HandshakeTimer {
            handle,
            admitted_at: Instant::now(),
        });
        Ok(())
    }

    fn admit(&mut self, conn: Connection<C, TcpStream, M>) -> Result<Handle, Error<C::Error>> {
        // Registration needs the pool handle as its token, so the
        // connection must already live in the pool before we can register
        // its socket.
        let handle = self.conns.create(conn)?;
        if let Err(e) = self.reserve_timer_slot(handle) {
            self.conns.destroy(handle);
            return Err(e);
        }
        let token = Token(handle);
        let socket = self
            .conns
            .get_mut(handle)
            .expect("just inserted")
            .socket_mut();
        if let Err(e) = self.poll.registry().register(socket, token, Interest::READABLE) {
            self.conns.destroy(handle);
            self.clear_timer(handle);
            return Err(e.into());
        }
        Ok(handle)
    }

    fn accept(&mut self) -> Result<(), Error<C::Error>> {
        let listener = self.listener.as_ref().ok_or(Error::NotListening)?;
        loop {
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return Ok(());
                }
            };
            let args = self
                .args
                .as_ref()
                .expect("args is set together with listener")
                .clone();
            let conn = Connection::accept(stream, &args);
            match self.admit(conn) {
                Ok(handle) => trace!("accepted connection {} from {}", handle, peer),
                Err(Error::HandshakeQueueFull) => {
                    debug!("handshake queue full, dropping connection from {}", peer)
                }
                Err(Error::OutOfSpace(_)) => {
                    debug!("connection pool full, dropping connection from {}", peer)
                }
                Err(e) => warn!("failed to admit connection from {}: {}", peer, e),
            }
        }
    }

    fn clear_timer(&mut self, handle: Handle) {
        for slot in &mut self.timers {
            if slot.as_ref().map(|t| t.handle) == Some(handle) {
                *slot = None;
                break;
            }
        }
    }

    /// Waits up to `wait_ms` for up to `max_events` readiness events, then
    /// dispatches them, then sweeps the handshake-timer table for any
    /// connection that has exceeded `timeout_ms` without completing its
    /// handshake.
    ///
    /// All readiness-driven events from this call are delivered before the
    /// timeout sweep runs.
    #[allow(clippy::too_many_arguments)]
    pub fn poll(
        &mut self,
        on_open: &mut dyn FnMut(Handle, C::Result),
        on_message: &mut dyn FnMut(Handle, M),
        on_close: &mut dyn FnMut(Handle),
        max_events: usize,
        wait_ms: u64,
        timeout_ms: u64,
    ) -> Result<(), Error<C::Error>> {
        let mut events = Events::with_capacity(max_events);
        self.poll
            .poll(&mut events, Some(Duration::from_millis(wait_ms)))?;

        for event in &events {
            if event.token() == LISTENER_TOKEN {
                self.accept()?;
                continue;
            }
            let handle = event.token().0;
            let outcome = match self.conns.get_mut(handle) {
                Some(conn) => conn.recv(),
                None => continue,
            };
            match outcome {
                Ok(connection::Event::None) => {}
                Ok(connection::Event::Open(result)) => {
                    self.clear_timer(handle);
                    on_open(handle, result);
                }
                Ok(connection::Event::Message(message)) => {
                    on_message(handle, message);
                }
                Ok(connection::Event::Close) => {
                    self.conns.destroy(handle);
                    self.clear_timer(handle);
                    on_close(handle);
                }
                Err(e) => {
                    warn!("connection {} failed: {}", handle, e);
                    self.conns.destroy(handle);
                    self.clear_timer(handle);
                }
            }
        }

        let now = Instant::now();
        let timeout = Duration::from_millis(timeout_ms);
        let expired: Vec<Handle> = self
            .timers
            .iter()
            .filter_map(|t| t.as_ref())
            .filter(|t| now.duration_since(t.admitted_at) >= timeout)
            .map(|t| t.handle)
            .collect();
        for handle in expired {
            debug!("handshake timeout for connection {}", handle);
            self.conns.destroy(handle);
            self.clear_timer(handle);
        }

        Ok(())
    }

    /// Serializes `message` and sends it on the connection at `handle`.
    pub fn send(&mut self, handle: Handle, message: &M) -> Result<(), Error<C::Error>> {
        let conn = self.conns.get_mut(handle).ok_or(Error::InvalidHandle)?;
        conn.send(message)?;
        Ok(())
    }

    /// The listening socket's bound address, useful when `listen` was
    /// given port `0` and the OS chose one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Closes every live connection, then the listening socket.
    pub fn halt(&mut self) {
        let handles: Vec<Handle> = self.conns.iter().map(|(h, _)| h).collect();
        for handle in handles {
            self.conns.destroy(handle);
        }
        self.timers.iter_mut().for_each(|t| *t = None);
        self.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::coded::Coded;
    use crate::message::{Corrupted, Message};
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;

    const CODE: [u8; 16] = [9u8; 16];

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

    fn connect_and_handshake(addr: SocketAddr) -> StdTcpStream {
        let mut socket = StdTcpStream::connect(addr).unwrap();
        socket.write_all(&CODE).unwrap();
        let mut reply = [0u8; 16];
        socket.read_exact(&mut reply).unwrap();
        assert_eq!(reply, CODE);
        socket
    }

    #[test]
    fn accepts_handshakes_and_echoes_messages() {
        let mut server: Server<Coded, Ping> = Server::new(4, 4).unwrap();
        server.listen(0, CODE).unwrap();
        let addr = server.local_addr().unwrap();

        let mut socket = connect_and_handshake(addr);
        let mut handle = None;
        for _ in 0..20 {
            server
                .poll(
                    &mut |h, _| handle = Some(h),
                    &mut |_, _: Ping| {},
                    &mut |_| {},
                    8,
                    50,
                    5_000,
                )
                .unwrap();
            if handle.is_some() {
                break;
            }
        }
        let handle = handle.expect("connection should have opened");

        socket.write_all(&[42]).unwrap();
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
        let (got_handle, value) = got.expect("message should have arrived");
        assert_eq!(got_handle, handle);
        assert_eq!(value, 42);

        server.send(handle, &Ping(value)).unwrap();
        let mut reply = [0u8; 1];
        socket.read_exact(&mut reply).unwrap();
        assert_eq!(reply[0], 42);
    }

    #[test]
    fn handshake_timeout_drops_a_silent_connection() {
        let mut server: Server<Coded, Ping> = Server::new(4, 4).unwrap();
        server.listen(0, CODE).unwrap();
        let addr = server.local_addr().unwrap();
        let _socket = StdTcpStream::connect(addr).unwrap();

        // Admit the connection with a timeout long enough that it cannot
        // yet expire, so the accept is the only thing this sweep can do.
        for _ in 0..5 {
            server
                .poll(&mut |_, _| {}, &mut |_, _: Ping| {}, &mut |_| {}, 8, 20, 5_000)
                .unwrap();
        }
        // The server admits its first connection at handle 0; confirm it's
        // live (just not yet open, since no handshake bytes were sent)
        // before the timeout sweep removes it.
        assert!(matches!(server.send(0, &Ping(0)), Err(Error::Connection(_))));

        // A timeout of 0 immediately expires the still-handshaking
        // connection. Per the propagation policy, a timeout drop does not
        // fire `on_close` — confirm the slot is gone some other way: the
        // handle is no longer valid for `send`.
        server
            .poll(&mut |_, _| {}, &mut |_, _: Ping| {}, &mut |_| {}, 8, 20, 0)
            .unwrap();
        assert!(matches!(server.send(0, &Ping(0)), Err(Error::InvalidHandle)));
    }

    #[test]
    fn send_to_unknown_handle_is_an_error() {
        let mut server: Server<Coded, Ping> = Server::new(4, 4).unwrap();
        assert!(matches!(server.send(0, &Ping(1)), Err(Error::InvalidHandle)));
    }
}
