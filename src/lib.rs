// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A fixed-capacity, single-threaded connection server for interactive
//! multiplayer game sessions.
//!
//! Every connection is admitted through a pluggable handshake [`Codec`]
//! ([`codec::coded::Coded`], [`codec::ae::Ae`], [`codec::websocket::Websocket`],
//! or a [`codec::websockify::Websockify`] composition of the two), then
//! exchanges fixed-size [`Message`] values. Nothing in this crate
//! allocates after construction: pools, buffers, and the handshake-timer
//! table are sized once and reused for the life of the server.
//!
//! [`server::Server`] drives many connections off one readiness
//! descriptor; [`client::Client`] drives a single outbound connection the
//! same way.
#![deny(missing_docs)]

pub mod buffer;
pub mod client;
pub mod codec;
pub mod connection;
pub mod message;
pub mod pool;
pub mod ring;
pub mod server;

pub use client::Client;
pub use codec::Codec;
pub use connection::Connection;
pub use message::Message;
pub use pool::Pool;
pub use server::Server;
