//! Authentication key derivation and challenge hashing
//!
//! The device and controller prove knowledge of the device identifier by
//! exchanging hashes of single-use 8-byte values. The hash doubles the
//! value into one AES block and encrypts it with a key derived from the
//! identifier; the first 8 output bytes are kept.

use crate::types::{LinkError, Result};
use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

/// Length of the device identifier printed on the hardware
const DEVICE_ID_LEN: usize = 6;

/// A device identifier, used both for discovery and for key derivation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.len() != DEVICE_ID_LEN || !id.is_ascii() {
            return Err(LinkError::Authentication(format!(
                "device id must be {} ASCII characters, got {:?}",
                DEVICE_ID_LEN, id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The symmetric key is the identifier interleaved with zero padding
    fn crypt_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        let padded = format!("00{id}00{id}", id = self.0);
        key.copy_from_slice(padded.as_bytes());
        key
    }

    /// Hash an 8-byte value: encrypt the doubled value, keep 8 bytes
    pub fn compute_hash(&self, value: &[u8; 8]) -> [u8; 8] {
        let cipher = Aes128::new(GenericArray::from_slice(&self.crypt_key()));

        let mut block = [0u8; 16];
        block[..8].copy_from_slice(value);
        block[8..].copy_from_slice(value);

        let mut block = GenericArray::from(block);
        cipher.encrypt_block(&mut block);

        block[..8].try_into().unwrap()
    }
}

/// State of one authentication handshake; lives for a single connection
#[derive(Debug)]
pub struct AuthSession {
    pub device_id: DeviceId,
    /// Our single-use token, sent in the opening request
    pub token: [u8; 8],
    /// The device's challenge value, once received
    pub challenge: Option<[u8; 8]>,
    pub authenticated: bool,
    pub bonded: bool,
}

impl AuthSession {
    /// Begin a handshake with a fresh random token
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            token: rand::random(),
            challenge: None,
            authenticated: false,
            bonded: false,
        }
    }

    /// Verify the device's hash of our token
    pub fn verify_token_hash(&self, token_hash: &[u8; 8]) -> bool {
        self.device_id.compute_hash(&self.token) == *token_hash
    }

    /// Record the device's challenge and produce our hash of it
    pub fn answer_challenge(&mut self, challenge: [u8; 8]) -> [u8; 8] {
        self.challenge = Some(challenge);
        self.device_id.compute_hash(&challenge)
    }
}
