use md5::{Digest, Md5};

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration, no salt.
///
/// D_i = MD5(D_{i-1} || password), concatenated until `key_len` bytes.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key: Vec<u8> = Vec::with_capacity(key_len + 16);

    while key.len() < key_len {
        let mut hasher = Md5::new();
        if key.len() >= 16 {
            hasher.update(&key[key.len() - 16..]);
        }
        hasher.update(password);
        key.extend_from_slice(&hasher.finalize());
    }

    key.truncate(key_len);
    key
}
