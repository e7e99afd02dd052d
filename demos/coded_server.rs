// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Listens on 8081 with the `Coded` handshake and echoes every
//! `ChatMessage` it receives back to its sender.

#[path = "common/mod.rs"]
mod common;

use common::{BoxedError, ChatMessage};
use stagehand::codec::coded::Coded;
use stagehand::server::Server;

const CODE: [u8; 16] = [
    0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F,
];

fn main() -> Result<(), BoxedError> {
    env_logger::init();
    let mut server: Server<Coded, ChatMessage> = Server::new(64, 16)?;
    server.listen(8081, CODE)?;
    log::info!("listening on 0.0.0.0:8081");

    let mut to_echo = Vec::new();
    loop {
        server.poll(
            &mut |handle, _result| log::info!("connection {} open", handle),
            &mut |handle, message| {
                log::info!("connection {} said {:?}", handle, message.text);
                to_echo.push((handle, message));
            },
            &mut |handle| log::info!("connection {} closed", handle),
            64,
            1000,
            5000,
        )?;
        for (handle, message) in to_echo.drain(..) {
            if let Err(e) = server.send(handle, &message) {
                log::warn!("failed to echo to {}: {}", handle, e);
            }
        }
    }
}
