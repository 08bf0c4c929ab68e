//! Handshake cryptography for the device's local-network session setup.
//!
//! The device firmware mandates a fixed hybrid scheme:
//!
//! - the session offer is encrypted with AES-256 in ECB mode, padded with
//!   PKCS#7-style byte padding, then base64-encoded;
//! - the AES key (a 32 character hex string whose ASCII bytes are the key) is
//!   encrypted with the device's RSA key using PKCS#1 v1.5 padding, in chunks
//!   of `key_size - 11` bytes, concatenated and base64-encoded.
//!
//! These primitives are reproduced bit-exact. They are weak by modern
//! standards but the device accepts nothing else.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::error::HandshakeError;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Length of a session key in hex characters (and AES key bytes).
pub const SESSION_KEY_LENGTH: usize = 32;

/// Bytes of PKCS#1 v1.5 overhead per RSA block.
pub const RSA_PKCS1_OVERHEAD: usize = 11;

/// Prefix mixed into the data channel validation challenge.
pub const VALIDATION_PREFIX: &str = "UnitreeGo2_";

/// Single-use symmetric key for one handshake attempt.
///
/// The key is rendered as 32 lowercase hex characters and the ASCII bytes of
/// that string are used directly as the AES-256 key. It is intentionally not
/// `Clone`: each attempt owns exactly one key and drops it when done.
pub struct SessionKey(String);

impl SessionKey {
    /// Generates a fresh key from the operating system's random source.
    pub fn generate() -> Self {
        let bytes: [u8; SESSION_KEY_LENGTH / 2] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Wraps an existing hex key, checking its length and alphabet.
    pub fn from_hex(key: &str) -> Result<Self, HandshakeError> {
        if key.len() != SESSION_KEY_LENGTH || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HandshakeError::DecryptFailure(format!(
                "session key must be {} hex characters",
                SESSION_KEY_LENGTH
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Returns the hex rendering that is wrapped for the device.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn cipher(&self) -> Aes256 {
        Aes256::new(GenericArray::from_slice(self.0.as_bytes()))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// RSA public key announced by the device for one handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePublicKey(RsaPublicKey);

impl RemotePublicKey {
    /// Parses the key material found between the notification markers.
    ///
    /// Accepts SPKI or PKCS#1 PEM blocks (with or without line breaks) and
    /// bare base64 DER in either encoding.
    pub fn parse(material: &str) -> Result<Self, HandshakeError> {
        let material = material.trim();
        if material.contains("-----BEGIN") {
            if let Ok(key) = RsaPublicKey::from_public_key_pem(material) {
                return Ok(Self(key));
            }
            if let Ok(key) = RsaPublicKey::from_pkcs1_pem(material) {
                return Ok(Self(key));
            }
            return Self::from_base64_der(&pem_body(material));
        }
        Self::from_base64_der(material)
    }

    fn from_base64_der(encoded: &str) -> Result<Self, HandshakeError> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let der = BASE64
            .decode(compact.as_bytes())
            .map_err(|e| HandshakeError::MalformedKey(format!("key is not base64: {}", e)))?;

        RsaPublicKey::from_public_key_der(&der)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
            .map(Self)
            .map_err(|e| HandshakeError::MalformedKey(format!("key is not valid DER: {}", e)))
    }

    /// Returns the modulus size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.0.size()
    }

    /// Returns the largest plaintext chunk one RSA block can carry.
    pub fn chunk_size(&self) -> usize {
        self.size_bytes().saturating_sub(RSA_PKCS1_OVERHEAD)
    }

    /// Returns the wrapped key.
    pub fn as_rsa(&self) -> &RsaPublicKey {
        &self.0
    }
}

impl From<RsaPublicKey> for RemotePublicKey {
    fn from(key: RsaPublicKey) -> Self {
        Self(key)
    }
}

/// Strips PEM armour lines, leaving only the base64 body.
fn pem_body(pem: &str) -> String {
    let mut body = pem;
    if let Some(start) = body.find("-----BEGIN") {
        let after = &body[start + "-----BEGIN".len()..];
        if let Some(end) = after.find("-----") {
            body = &after[end + "-----".len()..];
        }
    }
    if let Some(end) = body.find("-----END") {
        body = &body[..end];
    }
    body.chars().filter(|c| !c.is_whitespace()).collect()
}

/// The paired ciphertexts submitted to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeEnvelope {
    /// Base64 AES-ECB ciphertext of the offer.
    pub data1: String,
    /// Base64 concatenated RSA blocks wrapping the session key.
    pub data2: String,
}

/// Encrypts the offer and wraps the session key for the device.
pub fn encrypt_handshake(
    offer: &str,
    session_key: &SessionKey,
    remote_key: &RemotePublicKey,
) -> Result<HandshakeEnvelope, HandshakeError> {
    Ok(HandshakeEnvelope {
        data1: aes_ecb_encrypt(offer.as_bytes(), session_key),
        data2: rsa_encrypt_chunked(session_key.as_str().as_bytes(), remote_key)?,
    })
}

/// Pads and encrypts `plaintext` with AES-256-ECB, returning base64.
pub fn aes_ecb_encrypt(plaintext: &[u8], key: &SessionKey) -> String {
    let mut buf = pad(plaintext);
    encrypt_blocks(&key.cipher(), &mut buf);
    BASE64.encode(buf)
}

/// Decodes, decrypts and unpads a base64 AES-256-ECB ciphertext into text.
pub fn aes_ecb_decrypt(ciphertext: &str, key: &SessionKey) -> Result<String, HandshakeError> {
    let mut buf = BASE64
        .decode(ciphertext.trim().as_bytes())
        .map_err(|e| HandshakeError::DecryptFailure(format!("response is not base64: {}", e)))?;

    if buf.is_empty() || buf.len() % AES_BLOCK_SIZE != 0 {
        return Err(HandshakeError::DecryptFailure(format!(
            "ciphertext length {} is not a positive multiple of {}",
            buf.len(),
            AES_BLOCK_SIZE
        )));
    }

    decrypt_blocks(&key.cipher(), &mut buf);
    let content_len = unpad(&buf)?;
    buf.truncate(content_len);

    String::from_utf8(buf)
        .map_err(|e| HandshakeError::DecryptFailure(format!("plaintext is not UTF-8: {}", e)))
}

/// Appends byte padding: `n` copies of `n`, a full block when already aligned.
fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = AES_BLOCK_SIZE - (data.len() % AES_BLOCK_SIZE);
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    out.resize(data.len() + pad_len, pad_len as u8);
    out
}

/// Reads the final byte as the pad length and returns the content length.
fn unpad(data: &[u8]) -> Result<usize, HandshakeError> {
    let pad_len = data.last().copied().unwrap_or(0) as usize;
    if pad_len == 0 || pad_len > AES_BLOCK_SIZE || pad_len > data.len() {
        return Err(HandshakeError::DecryptFailure(format!(
            "invalid padding length {}",
            pad_len
        )));
    }
    Ok(data.len() - pad_len)
}

pub(crate) fn encrypt_blocks(cipher: &Aes256, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
}

fn decrypt_blocks(cipher: &Aes256, buf: &mut [u8]) {
    for block in buf.chunks_exact_mut(AES_BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
}

/// Encrypts `data` under PKCS#1 v1.5 in `key_size - 11` byte chunks.
///
/// The RSA blocks are concatenated before base64 encoding, so the output
/// decodes to `ceil(len / chunk) * key_size` bytes.
pub fn rsa_encrypt_chunked(data: &[u8], key: &RemotePublicKey) -> Result<String, HandshakeError> {
    let chunk_size = key.chunk_size();
    if chunk_size == 0 {
        return Err(HandshakeError::MalformedKey(format!(
            "{} byte key cannot carry PKCS#1 v1.5 payload",
            key.size_bytes()
        )));
    }

    let mut rng = OsRng;
    let mut out = Vec::with_capacity(data.len().div_ceil(chunk_size) * key.size_bytes());
    for chunk in data.chunks(chunk_size) {
        let block = key
            .as_rsa()
            .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| HandshakeError::MalformedKey(format!("RSA encryption failed: {}", e)))?;
        out.extend_from_slice(&block);
    }

    Ok(BASE64.encode(out))
}

/// Computes the answer to a data channel validation challenge.
///
/// The answer is `base64(md5("UnitreeGo2_" + challenge))` over the raw digest.
pub fn validation_response(challenge: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(VALIDATION_PREFIX.as_bytes());
    hasher.update(challenge.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    fn fixed_key() -> SessionKey {
        SessionKey::from_hex("00112233445566778899aabbccddeeff").unwrap()
    }

    fn test_key_pair() -> (RsaPrivateKey, RemotePublicKey) {
        let private = RsaPrivateKey::new(&mut OsRng, 1024).expect("key generation");
        let public = RemotePublicKey::from(private.to_public_key());
        (private, public)
    }

    #[test]
    fn test_session_key_is_fixed_length_hex() {
        let key = SessionKey::generate();
        assert_eq!(key.as_str().len(), SESSION_KEY_LENGTH);
        assert!(key.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_keys_are_fresh() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a.as_str(), b.as_str());
    }

    #[test]
    fn test_session_key_rejects_wrong_length() {
        assert!(SessionKey::from_hex("abcd").is_err());
        assert!(SessionKey::from_hex("zz112233445566778899aabbccddeeff").is_err());
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = fixed_key();
        let debug = format!("{:?}", key);
        assert!(!debug.contains("0011"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_aes_roundtrip_across_block_boundaries() {
        let key = fixed_key();
        for len in [0usize, 15, 16, 17, 1000] {
            let plaintext: String = (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
            let ciphertext = aes_ecb_encrypt(plaintext.as_bytes(), &key);
            let decoded = BASE64.decode(&ciphertext).unwrap();
            assert_eq!(decoded.len(), (len / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE);

            let recovered = aes_ecb_decrypt(&ciphertext, &key).unwrap();
            assert_eq!(recovered, plaintext, "roundtrip failed for length {}", len);
        }
    }

    #[test]
    fn test_padding_uses_pad_count_bytes() {
        assert_eq!(pad(b"abc")[3..], [13u8; 13]);
        assert_eq!(pad(&[0u8; 16])[16..], [16u8; 16]);
    }

    #[test]
    fn test_ecb_encrypts_identical_blocks_identically() {
        let key = fixed_key();
        let ciphertext = BASE64
            .decode(aes_ecb_encrypt(&[b'x'; 32], &key))
            .unwrap();
        assert_eq!(ciphertext[0..16], ciphertext[16..32]);
    }

    #[test]
    fn test_decrypt_rejects_out_of_range_padding() {
        let key = fixed_key();
        for last in [0u8, 17, 200] {
            let mut block = [b'a'; AES_BLOCK_SIZE];
            block[AES_BLOCK_SIZE - 1] = last;
            encrypt_blocks(&key.cipher(), &mut block);
            let result = aes_ecb_decrypt(&BASE64.encode(block), &key);
            assert!(
                matches!(result, Err(HandshakeError::DecryptFailure(_))),
                "pad byte {} should be rejected",
                last
            );
        }
    }

    #[test]
    fn test_decrypt_rejects_unaligned_ciphertext() {
        let key = fixed_key();
        let result = aes_ecb_decrypt(&BASE64.encode([1u8; 15]), &key);
        assert!(matches!(result, Err(HandshakeError::DecryptFailure(_))));

        let result = aes_ecb_decrypt("", &key);
        assert!(matches!(result, Err(HandshakeError::DecryptFailure(_))));
    }

    #[test]
    fn test_decrypt_rejects_non_utf8() {
        let key = fixed_key();
        let mut block = [0xFFu8; AES_BLOCK_SIZE];
        block[AES_BLOCK_SIZE - 1] = 1;
        encrypt_blocks(&key.cipher(), &mut block);
        let result = aes_ecb_decrypt(&BASE64.encode(block), &key);
        assert!(matches!(result, Err(HandshakeError::DecryptFailure(_))));
    }

    #[test]
    fn test_decrypt_with_wrong_key_never_returns_original() {
        let ciphertext = aes_ecb_encrypt(b"{\"sdp\":\"v=0\"}", &fixed_key());
        let other = SessionKey::from_hex("ffeeddccbbaa99887766554433221100").unwrap();
        if let Ok(text) = aes_ecb_decrypt(&ciphertext, &other) {
            assert_ne!(text, "{\"sdp\":\"v=0\"}");
        }
    }

    #[test]
    fn test_rsa_chunked_encrypt_produces_one_block_per_chunk() {
        let (private, public) = test_key_pair();
        let chunk = public.chunk_size();
        assert_eq!(chunk, public.size_bytes() - RSA_PKCS1_OVERHEAD);

        for k in 1..=3usize {
            let plaintext: Vec<u8> = (0..k * chunk).map(|i| (i % 251) as u8).collect();
            let encoded = rsa_encrypt_chunked(&plaintext, &public).unwrap();
            let ciphertext = BASE64.decode(encoded).unwrap();
            assert_eq!(ciphertext.len(), k * public.size_bytes());

            let mut recovered = Vec::new();
            for block in ciphertext.chunks(public.size_bytes()) {
                recovered.extend(private.decrypt(Pkcs1v15Encrypt, block).unwrap());
            }
            assert_eq!(recovered, plaintext);
        }
    }

    #[test]
    fn test_encrypt_handshake_wraps_session_key() {
        let (private, public) = test_key_pair();
        let key = fixed_key();
        let envelope = encrypt_handshake("{\"type\":\"offer\"}", &key, &public).unwrap();

        let wrapped = BASE64.decode(&envelope.data2).unwrap();
        let unwrapped = private.decrypt(Pkcs1v15Encrypt, &wrapped).unwrap();
        assert_eq!(unwrapped, key.as_str().as_bytes());

        let offer = aes_ecb_decrypt(&envelope.data1, &key).unwrap();
        assert_eq!(offer, "{\"type\":\"offer\"}");
    }

    #[test]
    fn test_parse_public_key_formats() {
        use rsa::pkcs1::EncodeRsaPublicKey;
        use rsa::pkcs8::{EncodePublicKey, LineEnding};

        let (_, public) = test_key_pair();
        let spki_pem = public.as_rsa().to_public_key_pem(LineEnding::LF).unwrap();
        let pkcs1_pem = public.as_rsa().to_pkcs1_pem(LineEnding::LF).unwrap();
        let spki_der = public.as_rsa().to_public_key_der().unwrap();
        let single_line = spki_pem.replace('\n', "");

        for material in [
            spki_pem.clone(),
            pkcs1_pem.to_string(),
            BASE64.encode(spki_der.as_bytes()),
            single_line,
        ] {
            let parsed = RemotePublicKey::parse(&material).unwrap();
            assert_eq!(parsed, public);
        }
    }

    #[test]
    fn test_parse_public_key_rejects_garbage() {
        let result = RemotePublicKey::parse("-----BEGIN PUBLIC KEY-----abc-----END PUBLIC KEY-----");
        assert!(matches!(result, Err(HandshakeError::MalformedKey(_))));

        let result = RemotePublicKey::parse("not base64 at all!");
        assert!(matches!(result, Err(HandshakeError::MalformedKey(_))));
    }

    #[test]
    fn test_validation_response_matches_md5_base64() {
        // md5("UnitreeGo2_xyz") rendered as base64 of the raw digest
        let expected = BASE64.encode(Md5::digest(b"UnitreeGo2_xyz"));
        assert_eq!(validation_response("xyz"), expected);
        assert_eq!(validation_response("xyz").len(), 24);
        assert_ne!(validation_response("xyz"), validation_response("xyw"));
    }
}
