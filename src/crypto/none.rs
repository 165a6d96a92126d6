use bytes::Bytes;

use super::{CipherFamily, StreamCipher};
use crate::error::CryptoError;
use crate::transport::TransportKind;

pub(super) const FAMILY: CipherFamily = CipherFamily {
    name: "none",
    methods: &["none"],
    build,
};

/// Pass-through cipher
struct NoneCipher;

fn build(
    _method: &str,
    _key: &str,
    _kind: TransportKind,
) -> Result<Box<dyn StreamCipher>, CryptoError> {
    Ok(Box::new(NoneCipher))
}

impl StreamCipher for NoneCipher {
    fn encrypt(&mut self, plaintext: &[u8]) -> Bytes {
        Bytes::copy_from_slice(plaintext)
    }

    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::copy_from_slice(ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_identity() {
        let mut cipher = build("none", "ignored", TransportKind::Tcp).unwrap();
        assert_eq!(cipher.encrypt(b"plain").as_ref(), b"plain");
        assert_eq!(cipher.decrypt(b"plain").unwrap().as_ref(), b"plain");
    }
}
