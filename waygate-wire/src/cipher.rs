//! AEAD wrapper for the custom-remote wire protocol.
//!
//! Key derivation is a fixed ASCII label concatenated with the configured
//! `crypt` integer, SHA-256 hashed to a 32-byte key. A per-message random
//! nonce is generated and prepended to the ciphertext; `open` reads it back
//! off the front before decrypting.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::XChaCha20Poly1305;
use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_LABEL: &[u8] = b"waygate-wire-key:";

#[derive(Debug, Error)]
pub enum Error {
	#[error("AEAD seal failed")]
	SealFailed,
	#[error("AEAD open failed")]
	OpenFailed,
	#[error("ciphertext shorter than the expected nonce")]
	TooShort,
}

/// Derives the 32-byte AEAD key from the configured `crypt` integer.
pub fn derive_key(crypt: i64) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(KEY_LABEL);
	hasher.update(crypt.to_string().as_bytes());
	hasher.finalize().into()
}

/// The two AEAD variants a `ServerProfile` can select. ChaCha20-Poly1305
/// (XChaCha20 nonce) is the default; AES-256-GCM is selected for interop
/// with remotes that only implement WebCrypto's `AES-GCM`.
#[derive(Clone)]
pub enum Cipher {
	ChaCha20Poly1305(XChaCha20Poly1305),
	Aes256Gcm(Aes256Gcm),
}

impl Cipher {
	pub fn chacha20_poly1305(crypt: i64) -> Self {
		let key = derive_key(crypt);
		Cipher::ChaCha20Poly1305(XChaCha20Poly1305::new((&key).into()))
	}

	pub fn aes_256_gcm(crypt: i64) -> Self {
		let key = derive_key(crypt);
		Cipher::Aes256Gcm(Aes256Gcm::new((&key).into()))
	}

	fn nonce_len(&self) -> usize {
		match self {
			Cipher::ChaCha20Poly1305(_) => 24,
			Cipher::Aes256Gcm(_) => 12,
		}
	}

	/// Encrypts `plaintext`, returning `nonce || ciphertext`.
	pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
		match self {
			Cipher::ChaCha20Poly1305(cipher) => {
				let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
				let mut out = cipher.encrypt(&nonce, plaintext).map_err(|_| Error::SealFailed)?;
				let mut sealed = nonce.to_vec();
				sealed.append(&mut out);
				Ok(sealed)
			},
			Cipher::Aes256Gcm(cipher) => {
				let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
				let mut out = cipher.encrypt(&nonce, plaintext).map_err(|_| Error::SealFailed)?;
				let mut sealed = nonce.to_vec();
				sealed.append(&mut out);
				Ok(sealed)
			},
		}
	}

	/// Splits the leading nonce off `sealed` and decrypts the remainder.
	pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, Error> {
		let nonce_len = self.nonce_len();
		if sealed.len() < nonce_len {
			return Err(Error::TooShort);
		}
		let (nonce, ciphertext) = sealed.split_at(nonce_len);
		match self {
			Cipher::ChaCha20Poly1305(cipher) => cipher
				.decrypt(nonce.into(), ciphertext)
				.map_err(|_| Error::OpenFailed),
			Cipher::Aes256Gcm(cipher) => cipher
				.decrypt(nonce.into(), ciphertext)
				.map_err(|_| Error::OpenFailed),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn chacha_round_trips_and_rejects_tampering() {
		let cipher = Cipher::chacha20_poly1305(42);
		let sealed = cipher.seal(b"hello gateway").unwrap();
		assert_eq!(cipher.open(&sealed).unwrap(), b"hello gateway");

		let mut tampered = sealed.clone();
		*tampered.last_mut().unwrap() ^= 0xff;
		assert!(cipher.open(&tampered).is_err());
	}

	#[test]
	fn aes_gcm_round_trips_and_rejects_tampering() {
		let cipher = Cipher::aes_256_gcm(42);
		let sealed = cipher.seal(b"hello gateway").unwrap();
		assert_eq!(cipher.open(&sealed).unwrap(), b"hello gateway");

		let mut tampered = sealed.clone();
		*tampered.last_mut().unwrap() ^= 0xff;
		assert!(cipher.open(&tampered).is_err());
	}

	#[test]
	fn key_derivation_is_stable_for_a_given_crypt_value() {
		assert_eq!(derive_key(7), derive_key(7));
		assert_ne!(derive_key(7), derive_key(8));
	}

	#[test]
	fn open_rejects_ciphertext_shorter_than_the_nonce() {
		let cipher = Cipher::chacha20_poly1305(1);
		assert!(matches!(cipher.open(&[0u8; 4]), Err(Error::TooShort)));
	}
}
