// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Connects to `demos::coded_server`, completes the `Coded` handshake, and
//! sends one message, printing whatever comes back.

#[path = "common/mod.rs"]
mod common;

use std::net::SocketAddr;

use common::{BoxedError, ChatMessage};
use stagehand::client::Client;
use stagehand::codec::coded::Coded;

const CODE: [u8; 16] = [
    0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F, 0x00, 0x0D, 0xBE, 0xEF, 0x0F,
];

fn main() -> Result<(), BoxedError> {
    env_logger::init();
    let addr: SocketAddr = "127.0.0.1:8081".parse()?;
    let mut client: Client<Coded, ChatMessage> = Client::new()?;
    client.connect(addr, &CODE)?;

    let mut sent = false;
    loop {
        client.poll(
            &mut |_result| {
                log::info!("handshake complete, sending message");
            },
            &mut |message| {
                log::info!("server echoed: {:?}", message.text);
                std::process::exit(0);
            },
            &mut || {
                log::warn!("server closed the connection");
                std::process::exit(1);
            },
            1000,
        )?;
        if client.is_open() && !sent {
            client.send(&ChatMessage::new("Hello from the client!"))?;
            sent = true;
        }
    }
}
