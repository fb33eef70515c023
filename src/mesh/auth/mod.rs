//! C3: authenticator. Applied to every new stream, both directions, before
//! any protocol frames.
//!
//! Grounded on `original_source/src/easymesh/authentication.py`'s
//! `HMACAuthenticator`: both sides send their own random challenge first,
//! then read the peer's, compute an HMAC tag over the *peer's* challenge and
//! send it, then read the peer's tag and compare it (constant-time) to the
//! HMAC of the challenge *they themselves* sent.

use std::time::Duration;

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::warn;

use crate::mesh::error::{Error, Result};

#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAuthenticator;

#[async_trait::async_trait]
impl Authenticator for NoopAuthenticator {
    async fn authenticate<S>(&self, _stream: &mut S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        Ok(())
    }
}

pub struct HmacAuthenticator {
    key: hmac::Key,
    challenge_len: usize,
    timeout: Duration,
    rng: SystemRandom,
}

impl HmacAuthenticator {
    pub fn new(authkey: &[u8], challenge_len: usize, timeout: Duration) -> Self {
        HmacAuthenticator {
            key: hmac::Key::new(hmac::HMAC_SHA256, authkey),
            challenge_len,
            timeout,
            rng: SystemRandom::new(),
        }
    }

    fn random_challenge(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.challenge_len];
        self.rng
            .fill(&mut buf)
            .map_err(|_| Error::authentication("failed to generate random challenge"))?;
        Ok(buf)
    }

    async fn read_exact_timed<S>(&self, stream: &mut S, len: usize) -> Result<Vec<u8>>
    where
        S: tokio::io::AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; len];
        timeout(self.timeout, stream.read_exact(&mut buf))
            .await
            .map_err(|_| Error::authentication("timed out reading handshake data"))?
            .map_err(|_| Error::authentication("peer closed connection during handshake"))?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl Authenticator for HmacAuthenticator {
    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        let own_challenge = self.random_challenge()?;
        stream
            .write_all(&own_challenge)
            .await
            .map_err(|_| Error::authentication("failed to send challenge"))?;
        stream
            .flush()
            .await
            .map_err(|_| Error::authentication("failed to flush challenge"))?;

        let peer_challenge = self.read_exact_timed(stream, self.challenge_len).await?;

        let tag_for_peer = hmac::sign(&self.key, &peer_challenge);
        stream
            .write_all(tag_for_peer.as_ref())
            .await
            .map_err(|_| Error::authentication("failed to send hmac tag"))?;
        stream
            .flush()
            .await
            .map_err(|_| Error::authentication("failed to flush hmac tag"))?;

        let peer_tag = self
            .read_exact_timed(stream, hmac::HMAC_SHA256.digest_algorithm().output_len())
            .await?;

        match hmac::verify(&self.key, &own_challenge, &peer_tag) {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("hmac authentication tag mismatch");
                Err(Error::authentication("hmac tag mismatch"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn hmac_authenticator_succeeds_with_matching_keys() {
        let authkey = b"shared-secret";
        let a = HmacAuthenticator::new(authkey, 16, Duration::from_secs(1));
        let b = HmacAuthenticator::new(authkey, 16, Duration::from_secs(1));

        let (mut side_a, mut side_b) = duplex(1024);

        let (res_a, res_b) = tokio::join!(a.authenticate(&mut side_a), b.authenticate(&mut side_b));
        assert!(res_a.is_ok());
        assert!(res_b.is_ok());
    }

    #[tokio::test]
    async fn hmac_authenticator_fails_with_mismatched_keys() {
        let a = HmacAuthenticator::new(b"key-a", 16, Duration::from_secs(1));
        let b = HmacAuthenticator::new(b"key-b", 16, Duration::from_secs(1));

        let (mut side_a, mut side_b) = duplex(1024);

        let (res_a, res_b) = tokio::join!(a.authenticate(&mut side_a), b.authenticate(&mut side_b));
        assert!(res_a.is_err());
        assert!(res_b.is_err());
    }

    #[tokio::test]
    async fn hmac_authenticator_times_out_on_truncated_read() {
        let a = HmacAuthenticator::new(b"key", 16, Duration::from_millis(50));
        let (mut side_a, mut side_b) = duplex(1024);
        // side_b never writes anything back; side_a should time out waiting
        // for the peer's challenge.
        drop(tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = tokio::io::AsyncReadExt::read_exact(&mut side_b, &mut buf).await;
            // intentionally never responds
        }));
        let result = a.authenticate(&mut side_a).await;
        assert!(result.is_err());
    }
}
