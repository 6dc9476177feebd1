//! Shared-secret authentication of the local channel.
//!
//! Each side proves knowledge of the secret by returning the
//! HMAC-SHA256 of a random challenge; the secret never crosses the
//! channel.  The server challenges the client first, then the client
//! challenges the server.

use crate::{
    error::Error,
    imsg::{Handler, Message},
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fmt;

/// Length of the random challenge.
pub const NONCE_LENGTH: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// The shared secret supplied by the launcher, kept as a keyed MAC.
#[derive(Clone)]
pub struct Secret(HmacSha256);

impl Secret {
    pub fn new<T: Into<Vec<u8>>>(secret: T) -> Result<Self, Error> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(Error::InvalidArgument("empty secret".into()));
        }
        HmacSha256::new_from_slice(&secret)
            .map(Self)
            .map_err(|err| Error::InvalidArgument(err.to_string().into()))
    }

    fn mac(&self, nonce: &[u8]) -> HmacSha256 {
        let mut mac = self.0.clone();
        mac.update(nonce);
        mac
    }

    /// Compute the answer to a challenge.
    pub fn digest(&self, nonce: &[u8]) -> Vec<u8> {
        self.mac(nonce).finalize().into_bytes().to_vec()
    }

    /// Verify the answer to a challenge in constant time.
    pub fn verify(&self, nonce: &[u8], answer: &[u8]) -> bool {
        self.mac(nonce).verify_slice(answer).is_ok()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Challenge the peer and verify its answer.
pub async fn challenge(handler: &mut Handler, secret: &Secret) -> Result<(), Error> {
    let mut nonce = vec![0u8; NONCE_LENGTH];
    rand::rng().fill_bytes(&mut nonce);

    handler
        .send_message_internal(Message::new(Message::CHALLENGE), &nonce)
        .await?;
    let answer: Vec<u8> = handler.expect_message(Message::ANSWER).await?;

    if secret.verify(&nonce, &answer) {
        handler
            .send_message_internal(Message::new(Message::WELCOME), &())
            .await?;
        Ok(())
    } else {
        let _ = handler
            .send_message_internal(Message::new(Message::FAILURE), &())
            .await;
        Err(Error::AuthenticationFailed)
    }
}

/// Answer the peer's challenge.
pub async fn answer(handler: &mut Handler, secret: &Secret) -> Result<(), Error> {
    let nonce: Vec<u8> = handler.expect_message(Message::CHALLENGE).await?;
    if nonce.len() != NONCE_LENGTH {
        return Err(Error::AuthenticationFailed);
    }

    handler
        .send_message_internal(Message::new(Message::ANSWER), &secret.digest(&nonce))
        .await?;

    match handler.recv_message::<()>().await? {
        Some((message, ())) if message.id == Message::WELCOME => Ok(()),
        _ => Err(Error::AuthenticationFailed),
    }
}

/// Server side of the handshake.
///
/// Frames from the unauthenticated peer are limited to
/// `Message::HANDSHAKE_LENGTH`.
pub async fn accept(handler: &mut Handler, secret: &Secret) -> Result<(), Error> {
    handler.set_max_length(Message::HANDSHAKE_LENGTH);
    let result = match challenge(handler, secret).await {
        Ok(()) => answer(handler, secret).await,
        Err(err) => Err(err),
    };
    handler.set_max_length(Message::MAX_LENGTH);
    result
}

/// Client side of the handshake.
pub async fn connect(handler: &mut Handler, secret: &Secret) -> Result<(), Error> {
    handler.set_max_length(Message::HANDSHAKE_LENGTH);
    let result = match answer(handler, secret).await {
        Ok(()) => challenge(handler, secret).await,
        Err(err) => Err(err),
    };
    handler.set_max_length(Message::MAX_LENGTH);
    result
}
