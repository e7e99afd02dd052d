// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Listens on 8082 with the authenticated `Ae` handshake. Logs the peer's
//! long-term verify key once each connection opens.

#[path = "common/mod.rs"]
mod common;

use common::{BoxedError, ChatMessage};
use ed25519_dalek::Keypair;
use rand::rngs::OsRng;
use stagehand::codec::ae::Ae;
use stagehand::server::Server;

fn main() -> Result<(), BoxedError> {
    env_logger::init();
    let keypair = Keypair::generate(&mut OsRng);
    let mut server: Server<Ae, ChatMessage> = Server::new(64, 16)?;
    server.listen(8082, keypair.to_bytes())?;
    log::info!("listening on 0.0.0.0:8082");

    loop {
        server.poll(
            &mut |handle, verify_key| {
                log::info!("connection {} open, peer identity {}", handle, hex(&verify_key))
            },
            &mut |handle, message| log::info!("connection {} said {:?}", handle, message.text),
            &mut |handle| log::info!("connection {} closed", handle),
            64,
            1000,
            5000,
        )?;
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
