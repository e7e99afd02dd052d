// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! `AE`: an authenticated encrypted channel.
//!
//! Both peers perform an X25519 Diffie-Hellman exchange, sign their own
//! ephemeral keys with a long-term Ed25519 identity, and derive a shared
//! key with BLAKE2b. Frames thereafter are XChaCha20-Poly1305 sealed.

use blake2::{Blake2b, Digest};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::XChaCha20Poly1305;
use ed25519_dalek::{Keypair, PublicKey, Signature, Signer, Verifier};
use rand::RngCore;
use thiserror::Error;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};
use zeroize::Zeroize;

use super::{Codec, HandshakeEvent};

const KEYS_LEN: usize = 64;
const SIG_LEN: usize = 96;
const HEADER_LEN: usize = 40; // nonce[24] + mac[16]
const NONCE_LEN: usize = 24;
const MAC_LEN: usize = 16;

/// `AE` handshake/decode failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A handshake message failed to parse, sign, or verify.
    #[error("AE handshake failed")]
    HandshakeFailed,
    /// A received frame failed authenticated decryption.
    #[error("message failed authentication")]
    MessageCorrupted,
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
enum Stage {
    #[default]
    Keys,
    Signature,
    Done,
}

impl Stage {
    fn wire_len(self) -> usize {
        match self {
            Stage::Keys => KEYS_LEN,
            Stage::Signature => SIG_LEN,
            Stage::Done => 0,
        }
    }
}

/// Per-connection state for the `AE` handshake.
pub struct HandshakeData {
    accepting: bool,
    sending: Stage,
    awaiting: Stage,
    our_scalar: [u8; 32],
    our_dh: [u8; 32],
    our_nonce: [u8; 32],
    peer_dh: [u8; 32],
    peer_nonce: [u8; 32],
    local_keypair_bytes: [u8; 64],
    foreign_eddsa: [u8; 32],
    shared_key: [u8; 32],
}

impl Default for HandshakeData {
    fn default() -> Self {
        HandshakeData {
            accepting: false,
            sending: Stage::Keys,
            awaiting: Stage::Keys,
            our_scalar: [0u8; 32],
            our_dh: [0u8; 32],
            our_nonce: [0u8; 32],
            peer_dh: [0u8; 32],
            peer_nonce: [0u8; 32],
            local_keypair_bytes: [0u8; 64],
            foreign_eddsa: [0u8; 32],
            shared_key: [0u8; 32],
        }
    }
}

impl Drop for HandshakeData {
    fn drop(&mut self) {
        self.our_scalar.zeroize();
        self.shared_key.zeroize();
        self.local_keypair_bytes.zeroize();
    }
}

fn gen_dh_keypair() -> ([u8; 32], [u8; 32]) {
    let mut rng = rand::thread_rng();
    loop {
        let mut scalar = [0u8; 32];
        rng.fill_bytes(&mut scalar);
        let public = x25519(scalar, X25519_BASEPOINT_BYTES);
        if public != [0u8; 32] {
            return (scalar, public);
        }
    }
}

/// Our own role-tagged `M_keys` view, `{nonce, key}` for an acceptor and
/// `{key, nonce}` for an initiator.
fn our_keys_view(accepting: bool, nonce: &[u8; 32], dh: &[u8; 32]) -> [u8; KEYS_LEN] {
    let mut out = [0u8; KEYS_LEN];
    if accepting {
        out[..32].copy_from_slice(nonce);
        out[32..].copy_from_slice(dh);
    } else {
        out[..32].copy_from_slice(dh);
        out[32..].copy_from_slice(nonce);
    }
    out
}

/// The peer's role-tagged `M_keys` view: since the peer's role is the
/// opposite of ours, this is `our_keys_view(!accepting, peer_nonce, peer_dh)`.
fn peer_keys_view(accepting: bool, peer_nonce: &[u8; 32], peer_dh: &[u8; 32]) -> [u8; KEYS_LEN] {
    our_keys_view(!accepting, peer_nonce, peer_dh)
}

fn derive_shared_key(
    our_scalar: &[u8; 32],
    peer_dh: &[u8; 32],
    accept_dh: &[u8; 32],
    accept_nonce: &[u8; 32],
    connect_dh: &[u8; 32],
    connect_nonce: &[u8; 32],
) -> [u8; 32] {
    let dh_output = x25519(*our_scalar, *peer_dh);
    let mut hasher = Blake2b::<blake2::digest::consts::U32>::new();
    hasher.update(accept_dh);
    hasher.update(accept_nonce);
    hasher.update(connect_dh);
    hasher.update(connect_nonce);
    hasher.update(dh_output);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Authenticated, encrypted channel over X25519 + Ed25519 + BLAKE2b + XChaCha20-Poly1305.
pub struct Ae {
    key: [u8; 32],
    cipher: Option<XChaCha20Poly1305>,
}

impl Default for Ae {
    fn default() -> Self {
        Ae {
            key: [0u8; 32],
            cipher: None,
        }
    }
}

impl Drop for Ae {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl Ae {
    fn cipher(&mut self) -> &XChaCha20Poly1305 {
        let key = self.key;
        self.cipher
            .get_or_insert_with(|| XChaCha20Poly1305::new(GenericArray::from_slice(&key)))
    }

    /// Builds an `Ae` codec directly from an already-derived shared key,
    /// for use outside the handshake path (e.g. tests).
    pub fn with_key(key: [u8; 32]) -> Self {
        Ae { key, cipher: None }
    }
}

impl Codec for Ae {
    type HandshakeData = HandshakeData;
    /// The local long-term identity, as `Keypair::to_bytes()`. Carried as
    /// raw bytes rather than a live `Keypair` so `Server`/`Client` can
    /// `Clone` it into each new connection's handshake state; `Keypair`
    /// itself is deliberately not `Clone`.
    type Args = [u8; 64];
    type Result = [u8; 32];
    type Error = Error;

    const MIN_HANDSHAKE_SPACE: usize = SIG_LEN;

    fn accept(data: &mut Self::HandshakeData, args: &Self::Args) -> usize {
        data.accepting = true;
        data.local_keypair_bytes = *args;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut data.our_nonce);
        let (scalar, dh) = gen_dh_keypair();
        data.our_scalar = scalar;
        data.our_dh = dh;
        data.sending = Stage::Keys;
        data.awaiting = Stage::Keys;
        Stage::Keys.wire_len()
    }

    fn connect(
        data: &mut Self::HandshakeData,
        out: &mut [u8],
        args: &Self::Args,
    ) -> Result<HandshakeEvent, Self::Error> {
        data.accepting = false;
        data.local_keypair_bytes = *args;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut data.our_nonce);
        let (scalar, dh) = gen_dh_keypair();
        data.our_scalar = scalar;
        data.our_dh = dh;

        let view = our_keys_view(false, &data.our_nonce, &data.our_dh);
        out[..KEYS_LEN].copy_from_slice(&view);
        data.sending = Stage::Signature;
        data.awaiting = Stage::Keys;

        Ok(HandshakeEvent {
            out_len: KEYS_LEN,
            next_len: data.awaiting.wire_len(),
            rem_len: 0,
        })
    }

    fn handshake(
        data: &mut Self::HandshakeData,
        out: &mut [u8],
        input: &[u8],
    ) -> Result<Option<HandshakeEvent>, Self::Error> {
        let expect = data.awaiting.wire_len();
        if input.len() < expect {
            return Ok(None);
        }

        match data.awaiting {
            Stage::Keys => {
                if data.accepting {
                    // peer (initiator) layout: {key, nonce}
                    data.peer_dh.copy_from_slice(&input[0..32]);
                    data.peer_nonce.copy_from_slice(&input[32..64]);
                } else {
                    // peer (acceptor) layout: {nonce, key}
                    data.peer_nonce.copy_from_slice(&input[0..32]);
                    data.peer_dh.copy_from_slice(&input[32..64]);
                }
                data.awaiting = Stage::Signature;
            }
            Stage::Signature => {
                let sig_bytes = &input[0..64];
                let verify_key_bytes = &input[64..96];
                let verify_key = PublicKey::from_bytes(verify_key_bytes)
                    .map_err(|_| Error::HandshakeFailed)?;
                let signature =
                    Signature::from_bytes(sig_bytes).map_err(|_| Error::HandshakeFailed)?;
                let peer_view = peer_keys_view(data.accepting, &data.peer_nonce, &data.peer_dh);
                verify_key
                    .verify(&peer_view, &signature)
                    .map_err(|_| Error::HandshakeFailed)?;
                data.foreign_eddsa = verify_key.to_bytes();

                let (accept_dh, accept_nonce, connect_dh, connect_nonce) = if data.accepting {
                    (&data.our_dh, &data.our_nonce, &data.peer_dh, &data.peer_nonce)
                } else {
                    (&data.peer_dh, &data.peer_nonce, &data.our_dh, &data.our_nonce)
                };
                data.shared_key = derive_shared_key(
                    &data.our_scalar,
                    &data.peer_dh,
                    accept_dh,
                    accept_nonce,
                    connect_dh,
                    connect_nonce,
                );
                data.awaiting = Stage::Done;
            }
            Stage::Done => {}
        }

        let mut out_len = 0;
        match data.sending {
            Stage::Keys => {
                let view = our_keys_view(data.accepting, &data.our_nonce, &data.our_dh);
                out[..KEYS_LEN].copy_from_slice(&view);
                out_len = KEYS_LEN;
                data.sending = Stage::Signature;
            }
            Stage::Signature => {
                let view = our_keys_view(data.accepting, &data.our_nonce, &data.our_dh);
                let keypair =
                    Keypair::from_bytes(&data.local_keypair_bytes).map_err(|_| Error::HandshakeFailed)?;
                let signature = keypair.sign(&view);
                out[0..64].copy_from_slice(&signature.to_bytes());
                out[64..96].copy_from_slice(&keypair.public.to_bytes());
                out_len = SIG_LEN;
                data.sending = Stage::Done;
            }
            Stage::Done => {}
        }

        Ok(Some(HandshakeEvent {
            out_len,
            next_len: data.awaiting.wire_len(),
            rem_len: 0,
        }))
    }

    fn result(data: &Self::HandshakeData) -> Self::Result {
        data.foreign_eddsa
    }

    fn finish(data: Self::HandshakeData) -> Self {
        Ae::with_key(data.shared_key)
    }

    fn header_in_len(_m: usize) -> usize {
        HEADER_LEN
    }

    fn header_out_len(_m: usize) -> usize {
        HEADER_LEN
    }

    fn encode(&mut self, header: &mut [u8], body: &mut [u8]) {
        let mut rng = rand::thread_rng();
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        header[..NONCE_LEN].copy_from_slice(&nonce);
        let cipher = self.cipher();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], body)
            .expect("XChaCha20-Poly1305 encryption of a bounded buffer cannot fail");
        header[NONCE_LEN..NONCE_LEN + MAC_LEN].copy_from_slice(&tag);
    }

    fn decode(&mut self, header: &[u8], body: &mut [u8]) -> Result<(), Self::Error> {
        let nonce = GenericArray::from_slice(&header[..NONCE_LEN]).to_owned();
        let tag = GenericArray::from_slice(&header[NONCE_LEN..NONCE_LEN + MAC_LEN]).to_owned();
        let cipher = self.cipher();
        cipher
            .decrypt_in_place_detached(&nonce, &[], body, &tag)
            .map_err(|_| Error::MessageCorrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Keypair as EdKeypair;
    use rand::rngs::OsRng;

    fn keypair() -> Keypair {
        let mut csprng = OsRng;
        EdKeypair::generate(&mut csprng)
    }

    #[test]
    fn mutual_handshake_derives_equal_shared_keys_and_peer_identities() {
        let acceptor_keys = keypair();
        let initiator_keys = keypair();
        let acceptor_pub = acceptor_keys.public.to_bytes();
        let initiator_pub = initiator_keys.public.to_bytes();

        let mut acceptor = HandshakeData::default();
        Ae::accept(&mut acceptor, &acceptor_keys.to_bytes());

        let mut initiator = HandshakeData::default();
        let mut init_out = [0u8; SIG_LEN];
        let ev = Ae::connect(&mut initiator, &mut init_out, &initiator_keys.to_bytes()).unwrap();
        assert_eq!(ev.out_len, KEYS_LEN);

        // acceptor receives initiator's keys, sends its own keys
        let mut acc_out = [0u8; SIG_LEN];
        let ev = Ae::handshake(&mut acceptor, &mut acc_out, &init_out[..KEYS_LEN])
            .unwrap()
            .unwrap();
        assert_eq!(ev.out_len, KEYS_LEN);
        assert_eq!(ev.next_len, SIG_LEN);

        // initiator receives acceptor's keys, sends its signature
        let mut init_out2 = [0u8; SIG_LEN];
        let ev = Ae::handshake(&mut initiator, &mut init_out2, &acc_out[..KEYS_LEN])
            .unwrap()
            .unwrap();
        assert_eq!(ev.out_len, SIG_LEN);
        assert_eq!(ev.next_len, SIG_LEN);

        // acceptor receives initiator's signature, sends its own signature
        let mut acc_out2 = [0u8; SIG_LEN];
        let ev = Ae::handshake(&mut acceptor, &mut acc_out2, &init_out2[..SIG_LEN])
            .unwrap()
            .unwrap();
        assert_eq!(ev.out_len, SIG_LEN);
        assert_eq!(ev.next_len, 0);

        // initiator receives acceptor's signature, handshake completes
        let ev = Ae::handshake(&mut initiator, &mut [], &acc_out2[..SIG_LEN])
            .unwrap()
            .unwrap();
        assert_eq!(ev.next_len, 0);

        assert_eq!(Ae::result(&acceptor), initiator_pub);
        assert_eq!(Ae::result(&initiator), acceptor_pub);
        assert_eq!(acceptor.shared_key, initiator.shared_key);
    }

    #[test]
    fn bit_flip_in_ciphertext_fails_authentication() {
        let key = [9u8; 32];
        let mut codec = Ae::with_key(key);
        let mut header = [0u8; HEADER_LEN];
        let mut body = [1u8, 2, 3, 4];
        codec.encode(&mut header, &mut body);

        body[0] ^= 0x01;
        let mut codec2 = Ae::with_key(key);
        assert!(matches!(
            codec2.decode(&header, &mut body),
            Err(Error::MessageCorrupted)
        ));
    }

    #[test]
    fn encode_then_decode_roundtrips() {
        let key = [3u8; 32];
        let mut enc = Ae::with_key(key);
        let mut header = [0u8; HEADER_LEN];
        let plaintext = b"hello AE".to_vec();
        let mut body = plaintext.clone();
        enc.encode(&mut header, &mut body);
        assert_ne!(body, plaintext);

        let mut dec = Ae::with_key(key);
        dec.decode(&header, &mut body).unwrap();
        assert_eq!(body, plaintext);
    }
}
