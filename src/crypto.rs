// Copyright (c) 2025, The Warren Authors
// MIT License
// All rights reserved.

//! # Payload Encryption
//!
//! Symmetric encryption of message payloads using the AES-CBC profiles named
//! by the configuration. The [`Cipher`] trait is the seam: the broker uses
//! [`AesCbcCipher`] unless the caller supplies their own provider through the
//! component overrides.
//!
//! Keys are hex encoded. The IV is drawn fresh per message and travels with
//! it, hex encoded, in the encryption header block.

use crate::config::EncryptionProfile;
use crate::errors::Error;
use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

/// A symmetric cipher provider keyed by encryption profile.
///
/// The broker uses the built-in [`AesCbcCipher`] unless the caller supplies
/// an alternative through the component overrides.
pub trait Cipher: Send + Sync {
    /// Encrypts an outgoing payload under the given profile.
    ///
    /// # Parameters
    /// * `profile` - The encryption profile named by the publication
    /// * `plaintext` - The payload to encrypt
    ///
    /// # Returns
    /// * `Result<(String, Vec<u8>), Error>` - The hex encoded IV drawn for
    ///   this message and the ciphertext, or an error when the key does not
    ///   fit the algorithm
    fn encrypt(&self, profile: &EncryptionProfile, plaintext: &[u8])
        -> Result<(String, Vec<u8>), Error>;

    /// Decrypts an incoming payload under the given profile.
    ///
    /// # Parameters
    /// * `profile` - The profile named in the message encryption headers
    /// * `iv` - The hex encoded IV recovered from the message headers
    /// * `ciphertext` - The payload to decrypt
    ///
    /// # Returns
    /// * `Result<Vec<u8>, Error>` - The plaintext, or an error when the key,
    ///   IV or ciphertext do not line up
    fn decrypt(
        &self,
        profile: &EncryptionProfile,
        iv: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error>;
}

/// The built-in AES-CBC provider. Supports `aes-128-cbc`, `aes-192-cbc` and
/// `aes-256-cbc` with PKCS#7 padding.
#[derive(Debug, Default)]
pub struct AesCbcCipher;

impl Cipher for AesCbcCipher {
    fn encrypt(
        &self,
        profile: &EncryptionProfile,
        plaintext: &[u8],
    ) -> Result<(String, Vec<u8>), Error> {
        let key = decode_key(profile)?;
        let mut iv = vec![0u8; profile.iv_length];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = match profile.algorithm.as_str() {
            "aes-128-cbc" => encrypt_with::<Aes128>(&key, &iv, plaintext)?,
            "aes-192-cbc" => encrypt_with::<Aes192>(&key, &iv, plaintext)?,
            "aes-256-cbc" => encrypt_with::<Aes256>(&key, &iv, plaintext)?,
            other => {
                return Err(Error::Encryption(format!(
                    "unsupported algorithm: {other}"
                )))
            }
        };
        Ok((hex::encode(iv), ciphertext))
    }

    fn decrypt(
        &self,
        profile: &EncryptionProfile,
        iv: &str,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let key = decode_key(profile)?;
        let iv = hex::decode(iv)
            .map_err(|_| Error::Decryption(profile_name(profile).to_string()))?;

        match profile.algorithm.as_str() {
            "aes-128-cbc" => decrypt_with::<Aes128>(profile, &key, &iv, ciphertext),
            "aes-192-cbc" => decrypt_with::<Aes192>(profile, &key, &iv, ciphertext),
            "aes-256-cbc" => decrypt_with::<Aes256>(profile, &key, &iv, ciphertext),
            other => Err(Error::Decryption(format!(
                "{}: unsupported algorithm: {other}",
                profile_name(profile)
            ))),
        }
    }
}

fn profile_name(profile: &EncryptionProfile) -> &str {
    profile.name.as_deref().unwrap_or("anonymous")
}

/// Decodes the hex key and checks it against the key size of the algorithm.
fn decode_key(profile: &EncryptionProfile) -> Result<Vec<u8>, Error> {
    let key = hex::decode(&profile.key).map_err(|_| Error::InvalidKeyLength)?;
    let expected = match profile.algorithm.as_str() {
        "aes-128-cbc" => 16,
        "aes-192-cbc" => 24,
        "aes-256-cbc" => 32,
        _ => return Ok(key),
    };
    if key.len() != expected {
        return Err(Error::InvalidKeyLength);
    }
    Ok(key)
}

fn encrypt_with<C>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, Error>
where
    C: BlockEncryptMut + cipher::BlockCipher + cipher::KeyInit,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKeyLength)?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn decrypt_with<C>(
    profile: &EncryptionProfile,
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, Error>
where
    C: BlockDecryptMut + cipher::BlockCipher + cipher::KeyInit,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidKeyLength)?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption(profile_name(profile).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(key: &str, algorithm: &str) -> EncryptionProfile {
        EncryptionProfile {
            name: Some("well-known".to_string()),
            key: key.to_string(),
            iv_length: 16,
            algorithm: algorithm.to_string(),
        }
    }

    #[test]
    fn round_trips_aes_256() {
        let profile = profile(&"ab".repeat(32), "aes-256-cbc");
        let (iv, ciphertext) = AesCbcCipher.encrypt(&profile, b"test message").unwrap();
        assert_eq!(iv.len(), 32);
        assert_ne!(ciphertext, b"test message");
        let plaintext = AesCbcCipher.decrypt(&profile, &iv, &ciphertext).unwrap();
        assert_eq!(plaintext, b"test message");
    }

    #[test]
    fn round_trips_aes_128() {
        let profile = profile(&"cd".repeat(16), "aes-128-cbc");
        let (iv, ciphertext) = AesCbcCipher.encrypt(&profile, b"payload").unwrap();
        let plaintext = AesCbcCipher.decrypt(&profile, &iv, &ciphertext).unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[test]
    fn rejects_keys_of_the_wrong_length() {
        let profile = profile(&"ab".repeat(16), "aes-256-cbc");
        let err = AesCbcCipher.encrypt(&profile, b"test message").unwrap_err();
        assert_eq!(err.to_string(), "Invalid key length");
    }

    #[test]
    fn rejects_unsupported_algorithms() {
        let profile = profile(&"ab".repeat(32), "rot13");
        let err = AesCbcCipher.encrypt(&profile, b"test message").unwrap_err();
        assert!(err.to_string().contains("unsupported algorithm"));
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let profile = profile(&"ab".repeat(32), "aes-256-cbc");
        let (iv, mut ciphertext) = AesCbcCipher.encrypt(&profile, b"test message").unwrap();
        for byte in ciphertext.iter_mut() {
            *byte = byte.wrapping_add(1);
        }
        assert!(AesCbcCipher.decrypt(&profile, &iv, &ciphertext).is_err());
    }
}
