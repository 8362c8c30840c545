//! Session encryption and the Diffie-Hellman key exchange that seeds it.
//!
//! Peers exchange X25519 public keys as base64 text, derive the same shared
//! secret, and stretch it with PBKDF2-HMAC-SHA256 into an AES-256-GCM key.
//! Every encrypted buffer is `[12-byte nonce][ciphertext + tag]`.

use crate::config::KeyDerivation;
use crate::{CourierError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::Sha256;
use std::sync::Arc;
use x25519_dalek::{PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Encrypts and decrypts frame parts. `Off` passes data through untouched.
#[derive(Clone, Default)]
pub enum Encryptor {
    #[default]
    Off,
    Aes(Arc<Aes256Gcm>),
}

impl Encryptor {
    pub fn off() -> Self {
        Encryptor::Off
    }

    /// Build an AES-256-GCM encryptor keyed from a Diffie-Hellman shared secret.
    pub fn aes(shared_secret: &[u8], derivation: &KeyDerivation) -> Result<Self> {
        if derivation.iterations == 0 {
            return Err(CourierError::validation(
                "key_derivation.iterations",
                "must be greater than zero",
            ));
        }
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            shared_secret,
            &derivation.salt,
            derivation.iterations,
            &mut key,
        );
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| CourierError::Encryption {
            message: format!("invalid AES key: {}", e),
        })?;
        Ok(Encryptor::Aes(Arc::new(cipher)))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Encryptor::Aes(_))
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encryptor::Off => Ok(data.to_vec()),
            Encryptor::Aes(cipher) => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), data)
                    .map_err(|_| CourierError::Encryption {
                        message: "AES-GCM encryption failed".to_string(),
                    })?;
                let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
        }
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Encryptor::Off => Ok(data.to_vec()),
            Encryptor::Aes(cipher) => {
                if data.len() < NONCE_LEN {
                    return Err(CourierError::Encryption {
                        message: "encrypted buffer shorter than its nonce".to_string(),
                    });
                }
                let (nonce, ciphertext) = data.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| CourierError::Encryption {
                        message: "AES-GCM decryption failed (wrong key or tampered frame)"
                            .to_string(),
                    })
            }
        }
    }
}

impl std::fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Encryptor::Off => f.write_str("Encryptor::Off"),
            Encryptor::Aes(_) => f.write_str("Encryptor::Aes(..)"),
        }
    }
}

/// A local X25519 key pair for one key exchange.
pub struct DiffieHellmanKeys {
    secret: StaticSecret,
    public: PublicKey,
}

impl DiffieHellmanKeys {
    pub fn generate() -> Self {
        let secret = StaticSecret::from(rand::random::<[u8; KEY_LEN]>());
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key as base64 text, the payload of a key-exchange message.
    pub fn public_key_base64(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    /// Derive the shared secret from the peer's base64 public key.
    pub fn shared_secret(&self, peer_public_base64: &str) -> Result<[u8; KEY_LEN]> {
        let bytes = STANDARD
            .decode(peer_public_base64.trim())
            .map_err(|e| CourierError::KeyExchange {
                message: format!("peer public key is not base64: {}", e),
            })?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CourierError::KeyExchange {
            message: "peer public key must be 32 bytes".to_string(),
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(CourierError::KeyExchange {
                message: "peer public key is a low-order point".to_string(),
            });
        }
        Ok(*shared.as_bytes())
    }

    /// Derive the session encryptor from the peer's base64 public key.
    pub fn encryptor(
        &self,
        peer_public_base64: &str,
        derivation: &KeyDerivation,
    ) -> Result<Encryptor> {
        let secret = self.shared_secret(peer_public_base64)?;
        Encryptor::aes(&secret, derivation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_derivation() -> KeyDerivation {
        KeyDerivation {
            salt: b"test-salt".to_vec(),
            iterations: 10,
        }
    }

    #[test]
    fn test_off_passes_through() {
        let encryptor = Encryptor::off();
        assert!(!encryptor.is_active());
        assert_eq!(encryptor.encrypt(b"plain").unwrap(), b"plain");
        assert_eq!(encryptor.decrypt(b"plain").unwrap(), b"plain");
    }

    #[test]
    fn test_key_exchange_yields_matching_ciphers() {
        let client = DiffieHellmanKeys::generate();
        let server = DiffieHellmanKeys::generate();

        let client_enc = client
            .encryptor(&server.public_key_base64(), &fast_derivation())
            .unwrap();
        let server_enc = server
            .encryptor(&client.public_key_base64(), &fast_derivation())
            .unwrap();

        let sealed = client_enc.encrypt(b"secret payload").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"secret payload");
        assert_eq!(server_enc.decrypt(&sealed).unwrap(), b"secret payload");
    }

    #[test]
    fn test_different_salt_cannot_decrypt() {
        let client = DiffieHellmanKeys::generate();
        let server = DiffieHellmanKeys::generate();
        let other = KeyDerivation {
            salt: b"other-salt".to_vec(),
            iterations: 10,
        };

        let a = client.encryptor(&server.public_key_base64(), &fast_derivation()).unwrap();
        let b = server.encryptor(&client.public_key_base64(), &other).unwrap();

        let sealed = a.encrypt(b"x").unwrap();
        assert!(b.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_rejects_malformed_peer_key() {
        let keys = DiffieHellmanKeys::generate();
        assert!(matches!(
            keys.shared_secret("not base64!"),
            Err(CourierError::KeyExchange { .. })
        ));
        assert!(keys.shared_secret(&STANDARD.encode([1u8; 5])).is_err());
        // The all-zero point is low order.
        assert!(keys.shared_secret(&STANDARD.encode([0u8; 32])).is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let derivation = KeyDerivation {
            salt: vec![],
            iterations: 0,
        };
        assert!(Encryptor::aes(&[7u8; 32], &derivation).is_err());
    }
}
