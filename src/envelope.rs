//! Client-side envelope: packs a filename and file body into one padded
//! plaintext and seals it with AES-256-GCM.
//!
//! ## Layout (big-endian)
//!
//! ```text
//! [u16 name_len][u64 body_len][name bytes][body bytes][zero padding]
//! ```
//!
//! The padded plaintext is always a multiple of [`PADDING_BLOCK`] bytes. The
//! sealed output is `ciphertext || tag` and is what the server stores.
//!
//! ## Nonce
//!
//! Every seal uses the all-zero 96-bit nonce. That is only sound because a
//! key is generated per upload and sealed exactly once: one key, one seal,
//! one object. [`seal_file`] is the only entry point that mints keys.
//!
//! The key never reaches the server; it travels after the `#` of the share
//! link (see [`key_from_link`]).

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM authentication tag appended to every ciphertext.
pub const TAG_SIZE: usize = 16;

/// Plaintext is zero-padded up to a multiple of this many bytes.
pub const PADDING_BLOCK: usize = 4096;

const HEADER_SIZE: usize = 2 + 8;
const ZERO_NONCE: [u8; 12] = [0u8; 12];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("filename is {0} bytes, the limit is 65535")]
    FilenameTooLong(usize),
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
    #[error("wrong key or corrupted data")]
    Authentication,
    #[error("encryption failed")]
    Encryption,
    #[error("key must be 32 bytes of unpadded base64url")]
    InvalidKey,
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;

/// A per-upload AES-256 key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvelopeKey {
    bytes: [u8; KEY_SIZE],
}

impl EnvelopeKey {
    fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| EnvelopeError::InvalidKey)?;
        Ok(Self { bytes })
    }

    /// Parse the link-fragment form produced by [`EnvelopeKey::encode`].
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let mut raw = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|_| EnvelopeError::InvalidKey)?;
        let key = Self::from_bytes(&raw);
        raw.zeroize();
        key
    }

    /// Unpadded base64url, suitable for a URL fragment.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.bytes))
    }
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EnvelopeKey([REDACTED])")
    }
}

/// Build the padded plaintext for `name` and `body`.
pub fn pack(name: &str, body: &[u8]) -> Result<Vec<u8>> {
    let name_bytes = name.as_bytes();
    let name_len =
        u16::try_from(name_bytes.len()).map_err(|_| EnvelopeError::FilenameTooLong(name_bytes.len()))?;

    let payload_len = HEADER_SIZE + name_bytes.len() + body.len();
    let padded_len = payload_len.div_ceil(PADDING_BLOCK) * PADDING_BLOCK;

    let mut buf = Vec::with_capacity(padded_len);
    buf.extend_from_slice(&name_len.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u64).to_be_bytes());
    buf.extend_from_slice(name_bytes);
    buf.extend_from_slice(body);
    buf.resize(padded_len, 0);
    Ok(buf)
}

/// Split a plaintext produced by [`pack`] back into name and body. Trailing
/// padding is skipped using the length fields.
pub fn unpack(plaintext: &[u8]) -> Result<(String, Vec<u8>)> {
    if plaintext.len() < HEADER_SIZE {
        return Err(EnvelopeError::Malformed("shorter than header"));
    }
    let name_len = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
    let mut body_len_bytes = [0u8; 8];
    body_len_bytes.copy_from_slice(&plaintext[2..HEADER_SIZE]);
    let body_len = usize::try_from(u64::from_be_bytes(body_len_bytes))
        .map_err(|_| EnvelopeError::Malformed("body length overflows"))?;

    let name_end = HEADER_SIZE + name_len;
    let body_end = name_end
        .checked_add(body_len)
        .ok_or(EnvelopeError::Malformed("body length overflows"))?;
    if body_end > plaintext.len() {
        return Err(EnvelopeError::Malformed("length fields exceed plaintext"));
    }

    let name = std::str::from_utf8(&plaintext[HEADER_SIZE..name_end])
        .map_err(|_| EnvelopeError::Malformed("filename is not UTF-8"))?
        .to_string();
    let body = plaintext[name_end..body_end].to_vec();
    Ok((name, body))
}

/// AES-256-GCM seal under the zero nonce. Returns `ciphertext || tag`.
pub fn seal(key: &EnvelopeKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    key.cipher()
        .encrypt(Nonce::from_slice(&ZERO_NONCE), plaintext)
        .map_err(|_| EnvelopeError::Encryption)
}

/// AES-256-GCM open under the zero nonce. Any tag mismatch is reported as
/// [`EnvelopeError::Authentication`] and no plaintext is returned.
pub fn open(key: &EnvelopeKey, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < TAG_SIZE {
        return Err(EnvelopeError::Authentication);
    }
    key.cipher()
        .decrypt(Nonce::from_slice(&ZERO_NONCE), sealed)
        .map_err(|_| EnvelopeError::Authentication)
}

/// Encrypt a file under a freshly generated key.
///
/// Name validation happens before any key material exists.
pub fn seal_file(name: &str, body: &[u8]) -> Result<(EnvelopeKey, Vec<u8>)> {
    let mut plaintext = pack(name, body)?;
    let key = EnvelopeKey::generate();
    let sealed = seal(&key, &plaintext);
    plaintext.zeroize();
    Ok((key, sealed?))
}

/// Decrypt a blob produced by [`seal_file`].
pub fn open_file(key: &EnvelopeKey, sealed: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut plaintext = open(key, sealed)?;
    let unpacked = unpack(&plaintext);
    plaintext.zeroize();
    unpacked
}

/// Accept either a bare encoded key or a full share link
/// (`https://host/<id>#<key>`) and return the key.
pub fn key_from_link(link_or_key: &str) -> Result<EnvelopeKey> {
    let encoded = match link_or_key.rsplit_once('#') {
        Some((_, fragment)) => fragment,
        None => link_or_key,
    };
    EnvelopeKey::from_encoded(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn plaintext_is_padded_to_block() {
        let packed = pack("a.txt", b"0123456789").unwrap();
        assert_eq!(packed.len(), PADDING_BLOCK);
        assert_eq!(&packed[0..2], &[0, 5]);
        assert_eq!(&packed[2..10], &10u64.to_be_bytes());
        assert_eq!(&packed[10..15], b"a.txt");
        assert_eq!(&packed[15..25], b"0123456789");
        assert!(packed[25..].iter().all(|b| *b == 0));
    }

    #[test]
    fn exact_block_payload_gets_no_extra_block() {
        let body = vec![7u8; PADDING_BLOCK - HEADER_SIZE - 1];
        assert_eq!(pack("x", &body).unwrap().len(), PADDING_BLOCK);

        let body = vec![7u8; PADDING_BLOCK];
        assert_eq!(pack("", &body).unwrap().len(), 2 * PADDING_BLOCK);
    }

    #[test]
    fn sealed_size_is_padded_plus_tag() {
        let (_, sealed) = seal_file("a.txt", b"0123456789").unwrap();
        assert_eq!(sealed.len(), PADDING_BLOCK + TAG_SIZE);
    }

    #[test]
    fn trailing_zero_bytes_in_body_survive() {
        let body = [1u8, 0, 0, 0];
        let (key, sealed) = seal_file("zeros.bin", &body).unwrap();
        assert_eq!(open_file(&key, &sealed).unwrap().1, body);
    }

    #[test]
    fn empty_payload_and_empty_name_roundtrip() {
        let (key, sealed) = seal_file("", b"").unwrap();
        assert_eq!(open_file(&key, &sealed).unwrap(), (String::new(), Vec::new()));
    }

    #[test]
    fn block_multiple_payload_roundtrips() {
        let body: Vec<u8> = (0..2 * PADDING_BLOCK).map(|i| (i % 251) as u8).collect();
        let (key, sealed) = seal_file("big.bin", &body).unwrap();
        let (name, got) = open_file(&key, &sealed).unwrap();
        assert_eq!(name, "big.bin");
        assert_eq!(got, body);
    }

    #[test]
    fn filename_limit_is_enforced() {
        let ok = "n".repeat(u16::MAX as usize);
        assert!(pack(&ok, b"").is_ok());

        let long = "n".repeat(u16::MAX as usize + 1);
        assert_eq!(
            seal_file(&long, b"data").unwrap_err(),
            EnvelopeError::FilenameTooLong(u16::MAX as usize + 1)
        );
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let (_, sealed) = seal_file("a.txt", b"secret").unwrap();
        let other = EnvelopeKey::generate();
        assert_eq!(open_file(&other, &sealed).unwrap_err(), EnvelopeError::Authentication);
    }

    #[test]
    fn truncated_ciphertext_fails_authentication() {
        let (key, sealed) = seal_file("a.txt", b"secret").unwrap();
        assert_eq!(
            open_file(&key, &sealed[..sealed.len() - 1]).unwrap_err(),
            EnvelopeError::Authentication
        );
        assert_eq!(open_file(&key, &[]).unwrap_err(), EnvelopeError::Authentication);
    }

    #[test]
    fn each_seal_uses_a_new_key() {
        let (k1, c1) = seal_file("a", b"same").unwrap();
        let (k2, c2) = seal_file("a", b"same").unwrap();
        assert_ne!(k1.encode(), k2.encode());
        assert_ne!(c1, c2);
    }

    #[test]
    fn key_text_form_roundtrips() {
        let key = EnvelopeKey::generate();
        let encoded = key.encode();
        assert_eq!(encoded.len(), 43);
        assert!(!encoded.contains('='));
        assert_eq!(EnvelopeKey::from_encoded(&encoded).unwrap().bytes, key.bytes);

        assert_eq!(EnvelopeKey::from_encoded("short").unwrap_err(), EnvelopeError::InvalidKey);
        assert_eq!(EnvelopeKey::from_encoded("!!!").unwrap_err(), EnvelopeError::InvalidKey);
        assert_eq!(format!("{:?}", key), "EnvelopeKey([REDACTED])");
    }

    #[test]
    fn unpack_rejects_inconsistent_lengths() {
        assert!(matches!(unpack(&[0u8; 4]), Err(EnvelopeError::Malformed(_))));

        let mut packed = pack("a", b"abc").unwrap();
        packed[2..10].copy_from_slice(&(PADDING_BLOCK as u64).to_be_bytes());
        assert!(matches!(unpack(&packed), Err(EnvelopeError::Malformed(_))));

        let mut packed = pack("a", b"abc").unwrap();
        packed[2..10].copy_from_slice(&u64::MAX.to_be_bytes());
        assert!(matches!(unpack(&packed), Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn key_is_taken_from_link_fragment() {
        let key = EnvelopeKey::generate();
        let link = format!("https://drop.example/{}#{}", uuid::Uuid::new_v4(), key.encode());
        assert_eq!(key_from_link(&link).unwrap().bytes, key.bytes);
        assert_eq!(key_from_link(&key.encode()).unwrap().bytes, key.bytes);
        assert_eq!(
            key_from_link("https://drop.example/abc#").unwrap_err(),
            EnvelopeError::InvalidKey
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn roundtrip_any_name_and_body(
            name in ".{0,64}",
            body in proptest::collection::vec(any::<u8>(), 0..10_000),
        ) {
            let (key, sealed) = seal_file(&name, &body).unwrap();
            prop_assert_eq!(sealed.len() % PADDING_BLOCK, TAG_SIZE);
            let (got_name, got_body) = open_file(&key, &sealed).unwrap();
            prop_assert_eq!(got_name, name);
            prop_assert_eq!(got_body, body);
        }

        #[test]
        fn any_bit_flip_is_detected(
            body in proptest::collection::vec(any::<u8>(), 0..256),
            position in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let (key, mut sealed) = seal_file("t.bin", &body).unwrap();
            let idx = position.index(sealed.len());
            sealed[idx] ^= 1 << bit;
            prop_assert_eq!(open_file(&key, &sealed).unwrap_err(), EnvelopeError::Authentication);
        }
    }
}
