use std::sync::Arc;

use base64::prelude::*;
use http::{HeaderMap, HeaderName};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::Config;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verification {
    Verified,
    /// No secret configured and the server runs in development mode.
    Bypassed,
    Rejected,
}

impl Verification {
    pub fn accepted(&self) -> bool {
        !matches!(self, Verification::Rejected)
    }
}

/// Checks the provider's HMAC-SHA256 signature over the raw webhook body.
#[derive(Clone, Debug)]
pub struct SignatureVerifier {
    key: Option<hmac::Key>,
    headers: Vec<HeaderName>,
    allow_unsigned: bool,
}

impl SignatureVerifier {
    pub fn new(config: &Config) -> Self {
        let key = config.webhook.secret.as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()));

        let headers = config.webhook.signature_headers.iter()
            .filter_map(|h| HeaderName::from_bytes(h.to_ascii_lowercase().as_bytes()).ok())
            .collect();

        if key.is_none() {
            if config.development_mode() {
                tracing::warn!("No webhook secret configured. Unsigned webhooks will be accepted in development mode.");
            } else {
                tracing::error!("No webhook secret configured. All webhooks will be rejected.");
            }
        }

        Self {
            key,
            headers,
            allow_unsigned: config.development_mode(),
        }
    }

    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Verification {
        let Some(key) = &self.key else {
            if self.allow_unsigned {
                tracing::warn!("Webhook signature check bypassed: no secret configured");
                return Verification::Bypassed;
            }
            return Verification::Rejected;
        };

        let signature = self.headers.iter()
            .find_map(|name| headers.get(name))
            .and_then(|value| value.to_str().ok());

        match signature {
            Some(signature) if verify_hex(key, body, signature) => Verification::Verified,
            _ => Verification::Rejected,
        }
    }
}

fn verify_hex(key: &hmac::Key, body: &[u8], signature: &str) -> bool {
    match hex::decode(signature.trim()) {
        Ok(tag) => hmac::verify(key, body, &tag).is_ok(),
        Err(_) => false,
    }
}

pub fn sign_hex(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hex::encode(hmac::sign(&key, body).as_ref())
}

/// An AES-256-GCM ciphertext as stored on an account row, base64 encoded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
}

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("Invalid master key")]
    InvalidKey,
    #[error("Encryption failed")]
    Encryption,
    #[error("Decryption failed")]
    Decryption,
    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),
}

/// Encrypts provider API keys at rest.
#[derive(Clone)]
pub struct CredentialCipher {
    key: Arc<LessSafeKey>,
    rng: SystemRandom,
}

impl CredentialCipher {
    pub fn new(config: &Config) -> Result<Self, CipherError> {
        Self::from_hex(&config.encryption.master_key)
    }

    pub fn from_hex(master_key: &str) -> Result<Self, CipherError> {
        let bytes = Zeroizing::new(hex::decode(master_key).map_err(|_| CipherError::InvalidKey)?);
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes).map_err(|_| CipherError::InvalidKey)?;

        Ok(Self {
            key: Arc::new(LessSafeKey::new(unbound)),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CipherError::Encryption)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        let tag = self.key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
            .map_err(|_| CipherError::Encryption)?;

        Ok(EncryptedSecret {
            ciphertext: BASE64_STANDARD.encode(&in_out),
            iv: BASE64_STANDARD.encode(nonce),
            tag: BASE64_STANDARD.encode(tag.as_ref()),
        })
    }

    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Zeroizing<String>, CipherError> {
        let iv = BASE64_STANDARD.decode(&secret.iv)
            .map_err(|e| CipherError::InvalidFormat(format!("iv: {}", e)))?;
        let nonce = <[u8; NONCE_LEN]>::try_from(iv.as_slice())
            .map_err(|_| CipherError::InvalidFormat("iv length".to_string()))?;

        let mut buf = BASE64_STANDARD.decode(&secret.ciphertext)
            .map_err(|e| CipherError::InvalidFormat(format!("ciphertext: {}", e)))?;
        let tag = BASE64_STANDARD.decode(&secret.tag)
            .map_err(|e| CipherError::InvalidFormat(format!("tag: {}", e)))?;
        buf.extend_from_slice(&tag);
        let mut buf = Zeroizing::new(buf);

        let plaintext = self.key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), buf.as_mut_slice())
            .map_err(|_| CipherError::Decryption)?;

        let text = std::str::from_utf8(plaintext).map_err(|_| CipherError::Decryption)?;
        Ok(Zeroizing::new(text.to_string()))
    }
}
