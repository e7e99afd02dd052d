// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Exercises `demos::ws_coded_server` as an external WebSocket client would:
//! a real HTTP upgrade request followed by masked binary frames.
//!
//! `Websockify<Inner>`'s `connect` side is intentionally a no-op for the WS
//! phase (see `codec::websockify`'s module docs): this crate's `Websocket`
//! codec only implements the server half of RFC6455. So a client that
//! needs to actually interoperate with `ws_coded_server` — rather than
//! with another instance of this crate acting as the initiator — has to
//! speak the real upgrade handshake by hand, the same way the teacher's
//! `autobahn_client` example exercises its server from outside the crate.

#[path = "common/mod.rs"]
mod common;

use std::io::{Read, Write};
use std::net::TcpStream;

use common::{BoxedError, ChatMessage};
use rand::RngCore;
use sha1::{Digest, Sha1};
use stagehand::message::Message;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const CODE: [u8; 16] = [
    0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F,
];

fn main() -> Result<(), BoxedError> {
    env_logger::init();
    let mut socket = TcpStream::connect("127.0.0.1:8083")?;

    let mut key_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let key = base64::encode(key_bytes);
    let request = format!(
        "GET / HTTP/1.1\r\nHost: 127.0.0.1:8083\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        key
    );
    socket.write_all(request.as_bytes())?;

    let response = read_http_response(&mut socket)?;
    let expected_accept = {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        hasher.update(GUID.as_bytes());
        base64::encode(hasher.finalize())
    };
    if !response.contains(&expected_accept) {
        return Err("server's Sec-WebSocket-Accept did not match".into());
    }
    log::info!("websocket upgrade complete");

    send_masked_binary_frame(&mut socket, &CODE)?;
    let code_reply = read_binary_frame(&mut socket)?;
    if code_reply != CODE {
        return Err("server did not echo the code".into());
    }
    log::info!("code handshake complete, sending message");

    let mut body = vec![0u8; ChatMessage::LEN];
    ChatMessage::new("Hello from the client!").to_bytes(&mut body);
    send_masked_binary_frame(&mut socket, &body)?;

    let reply = read_binary_frame(&mut socket)?;
    let message = ChatMessage::from_bytes(&reply)?;
    log::info!("server echoed: {:?}", message.text);
    Ok(())
}

fn read_http_response(socket: &mut TcpStream) -> Result<String, BoxedError> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = socket.read(&mut chunk)?;
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn send_masked_binary_frame(socket: &mut TcpStream, payload: &[u8]) -> Result<(), BoxedError> {
    let mut mask = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut mask);
    let mut frame = vec![0x82u8];
    if payload.len() <= 125 {
        frame.push(0x80 | payload.len() as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    socket.write_all(&frame)?;
    Ok(())
}

fn read_binary_frame(socket: &mut TcpStream) -> Result<Vec<u8>, BoxedError> {
    let mut head = [0u8; 2];
    socket.read_exact(&mut head)?;
    let len_field = head[1] & 0x7F;
    let len = if len_field <= 125 {
        len_field as usize
    } else {
        let mut ext = [0u8; 2];
        socket.read_exact(&mut ext)?;
        u16::from_be_bytes(ext) as usize
    };
    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload)?;
    Ok(payload)
}
