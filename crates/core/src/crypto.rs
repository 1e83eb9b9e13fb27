//! Token wrapping, signing and tracking-id primitives.
//!
//! The token store only ever sees wrapped (symmetrically encrypted) token
//! values; the cipher itself is provisioned, this module owns the wrapping
//! contract. Signing backs the evaluator's `rsa_sign_sha256` host function.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use courier_domain::{CourierError, CourierResult, SignatureOutput};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Symmetric wrapping applied to token values before they leave the process.
pub trait TokenCipher: Send + Sync {
    /// Encrypt-and-encode a token value.
    fn ede(&self, plaintext: &str) -> CourierResult<String>;
    /// Decode-and-decrypt a stored token value.
    fn edd(&self, wrapped: &str) -> CourierResult<String>;
}

/// AES-256-GCM cipher; output is base64 of `nonce || ciphertext`.
pub struct AesGcmTokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmTokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmTokenCipher").field("key", &"[REDACTED]").finish()
    }
}

impl AesGcmTokenCipher {
    /// Build from a raw 32-byte key.
    pub fn new(key: &[u8]) -> CourierResult<Self> {
        if key.len() != 32 {
            return Err(CourierError::Config("token cipher key must be exactly 32 bytes".into()));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CourierError::Config(format!("token cipher init failed: {e}")))?;
        Ok(Self { cipher })
    }
}

impl TokenCipher for AesGcmTokenCipher {
    fn ede(&self, plaintext: &str) -> CourierResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CourierError::Internal(format!("token encryption failed: {e}")))?;
        let mut wrapped = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(wrapped))
    }

    fn edd(&self, wrapped: &str) -> CourierResult<String> {
        let raw = BASE64
            .decode(wrapped)
            .map_err(|e| CourierError::Internal(format!("token unwrap failed: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(CourierError::Internal("token unwrap failed: value too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CourierError::Internal(format!("token decryption failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| CourierError::Internal(format!("token decryption failed: {e}")))
    }
}

/// SHA-256 tracking id written with every token-store save, binding the
/// stored pair to the agent and job that produced it. Separators are the
/// literal `±` the store indexes on.
#[must_use]
pub fn tracking_id(ua: &str, rjid: &str, access: &str, refresh: &str, scope: &str) -> String {
    hex(&Sha256::digest(format!("{ua}±{rjid}±{access}±{refresh}±{scope}")))
}

/// RSA PKCS#1 v1.5 signature over SHA-256, from a PEM-encoded private key
/// (PKCS#8 or PKCS#1, optionally passphrase-protected).
pub fn rsa_sign_sha256(
    value: &str,
    pem: &str,
    password: Option<&str>,
    output: SignatureOutput,
) -> CourierResult<String> {
    let key = decode_private_key(pem, password)?;
    let signing_key = SigningKey::<Sha256>::new(key);
    let signature = signing_key.sign(value.as_bytes()).to_bytes();
    Ok(match output {
        SignatureOutput::Base64 => BASE64.encode(&signature),
        SignatureOutput::Hex => hex(&signature),
    })
}

fn decode_private_key(pem: &str, password: Option<&str>) -> CourierResult<RsaPrivateKey> {
    let decoded = match password {
        Some(password) => RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password)
            .map_err(|e| CourierError::Internal(format!("cannot decode encrypted key: {e}"))),
        None => RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| CourierError::Internal(format!("cannot decode private key: {e}"))),
    };
    decoded
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, byte| {
        out.push_str(&format!("{byte:02x}"));
        out
    })
}
