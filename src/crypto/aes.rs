//! AES in CFB-128 mode
//!
//! Stream framing: the first encrypted chunk carries a random 16-byte IV,
//! later chunks continue the keystream. Datagram framing: every packet
//! carries its own IV.

use aes::{Aes128, Aes192, Aes256};
use bytes::{Bytes, BytesMut};
use cfb_mode::cipher::generic_array::GenericArray;
use cfb_mode::cipher::{BlockCipher, BlockEncryptMut, InnerIvInit, KeyInit};
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::RngCore;

use super::{evp_bytes_to_key, CipherFamily, StreamCipher};
use crate::error::CryptoError;
use crate::transport::TransportKind;

const IV_LEN: usize = 16;

pub(super) const FAMILY: CipherFamily = CipherFamily {
    name: "aes",
    methods: &["aes-128-cfb", "aes-192-cfb", "aes-256-cfb"],
    build,
};

fn key_len(method: &str) -> Option<usize> {
    match method {
        "aes-128-cfb" => Some(16),
        "aes-192-cfb" => Some(24),
        "aes-256-cfb" => Some(32),
        _ => None,
    }
}

fn build(
    method: &str,
    password: &str,
    kind: TransportKind,
) -> Result<Box<dyn StreamCipher>, CryptoError> {
    let len = key_len(method).ok_or_else(|| CryptoError::UnsupportedCipher(method.to_string()))?;
    let key = evp_bytes_to_key(password.as_bytes(), len);
    match len {
        16 => AesCfb::<Aes128>::boxed(method, &key, kind),
        24 => AesCfb::<Aes192>::boxed(method, &key, kind),
        _ => AesCfb::<Aes256>::boxed(method, &key, kind),
    }
}

struct AesCfb<C>
where
    C: BlockEncryptMut + BlockCipher,
{
    cipher: C,
    kind: TransportKind,
    encryptor: Option<BufEncryptor<C>>,
    decryptor: Option<BufDecryptor<C>>,
}

impl<C> AesCfb<C>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Clone + Send + 'static,
{
    fn boxed(
        method: &str,
        key: &[u8],
        kind: TransportKind,
    ) -> Result<Box<dyn StreamCipher>, CryptoError> {
        let cipher = C::new_from_slice(key)
            .map_err(|_| CryptoError::UnsupportedCipher(method.to_string()))?;
        Ok(Box::new(Self {
            cipher,
            kind,
            encryptor: None,
            decryptor: None,
        }))
    }

    fn needs_iv(&self, has_state: bool) -> bool {
        !has_state || self.kind == TransportKind::Udp
    }
}

impl<C> StreamCipher for AesCfb<C>
where
    C: BlockEncryptMut + BlockCipher + KeyInit + Clone + Send + 'static,
{
    fn encrypt(&mut self, plaintext: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(IV_LEN + plaintext.len());

        if self.needs_iv(self.encryptor.is_some()) {
            let mut iv = [0u8; IV_LEN];
            rand::thread_rng().fill_bytes(&mut iv);
            out.extend_from_slice(&iv);
            self.encryptor = Some(BufEncryptor::inner_iv_init(
                self.cipher.clone(),
                GenericArray::from_slice(&iv),
            ));
        }

        let start = out.len();
        out.extend_from_slice(plaintext);
        if let Some(encryptor) = self.encryptor.as_mut() {
            encryptor.encrypt(&mut out[start..]);
        }
        out.freeze()
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Bytes, CryptoError> {
        let mut data = ciphertext;

        if self.needs_iv(self.decryptor.is_some()) {
            if data.len() < IV_LEN {
                return Err(CryptoError::Decryption(format!(
                    "{} bytes received, iv needs {}",
                    data.len(),
                    IV_LEN
                )));
            }
            let (iv, rest) = data.split_at(IV_LEN);
            self.decryptor = Some(BufDecryptor::inner_iv_init(
                self.cipher.clone(),
                GenericArray::from_slice(iv),
            ));
            data = rest;
        }

        let mut out = BytesMut::from(data);
        if let Some(decryptor) = self.decryptor.as_mut() {
            decryptor.decrypt(&mut out[..]);
        }
        Ok(out.freeze())
    }
}
