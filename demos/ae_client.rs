// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Connects to `demos::ae_server`, completes the authenticated `Ae`
//! handshake, and prints the server's long-term verify key.

#[path = "common/mod.rs"]
mod common;

use std::net::SocketAddr;

use common::{BoxedError, ChatMessage};
use ed25519_dalek::Keypair;
use rand::rngs::OsRng;
use stagehand::client::Client;
use stagehand::codec::ae::Ae;

fn main() -> Result<(), BoxedError> {
    env_logger::init();
    let keypair = Keypair::generate(&mut OsRng);
    let addr: SocketAddr = "127.0.0.1:8082".parse()?;
    let mut client: Client<Ae, ChatMessage> = Client::new()?;
    client.connect(addr, &keypair.to_bytes())?;

    let mut sent = false;
    loop {
        client.poll(
            &mut |verify_key| log::info!("server identity: {}", hex(&verify_key)),
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

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
