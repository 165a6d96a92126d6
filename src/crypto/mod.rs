//! Cipher selection
//!
//! Every cipher family declares the method names it supports. The families
//! are aggregated once into an immutable registry; constructing a cryptor is
//! a single lookup in that table.

mod aes;
mod kdf;
mod none;

pub use kdf::evp_bytes_to_key;

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::CryptoError;
use crate::logger::log;
use crate::transport::TransportKind;

/// A constructed, stateful cipher instance
pub trait StreamCipher: Send {
    /// Encrypt one outbound chunk, advancing internal state
    fn encrypt(&mut self, plaintext: &[u8]) -> Bytes;

    /// Decrypt one inbound chunk
    fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Bytes, CryptoError>;
}

/// Builder signature shared by all families
type BuildFn =
    fn(method: &str, key: &str, kind: TransportKind) -> Result<Box<dyn StreamCipher>, CryptoError>;

/// A cipher family and the method names it claims
pub struct CipherFamily {
    pub name: &'static str,
    pub methods: &'static [&'static str],
    build: BuildFn,
}

/// All compiled-in families
static FAMILIES: &[CipherFamily] = &[aes::FAMILY, none::FAMILY];

/// Method name -> owning family
pub struct CipherRegistry {
    methods: HashMap<&'static str, &'static CipherFamily>,
}

static REGISTRY: OnceLock<CipherRegistry> = OnceLock::new();

impl CipherRegistry {
    fn build() -> Self {
        let mut methods = HashMap::new();
        for family in FAMILIES {
            for method in family.methods {
                methods.insert(*method, family);
            }
        }
        Self { methods }
    }

    /// The process-wide registry
    pub fn global() -> &'static CipherRegistry {
        REGISTRY.get_or_init(Self::build)
    }

    /// Family name owning `method`, if any
    pub fn family_of(&self, method: &str) -> Option<&'static str> {
        self.methods
            .get(method.to_ascii_lowercase().as_str())
            .map(|f| f.name)
    }

    /// All supported method names, sorted
    pub fn methods(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    fn construct(
        &self,
        method: &str,
        key: &str,
        kind: TransportKind,
    ) -> Result<Box<dyn StreamCipher>, CryptoError> {
        let method = method.to_ascii_lowercase();
        let family = self
            .methods
            .get(method.as_str())
            .ok_or_else(|| CryptoError::UnsupportedCipher(method.clone()))?;
        (family.build)(&method, key, kind)
    }
}

/// Build the registry before serving any connection
pub fn init() -> &'static CipherRegistry {
    let registry = CipherRegistry::global();
    log::info!(methods = ?registry.methods(), "Cipher registry ready");
    registry
}

/// Cipher bound to one connection's method, key and transport framing
pub struct Cryptor {
    method: String,
    inner: Box<dyn StreamCipher>,
}

impl std::fmt::Debug for Cryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cryptor").field("method", &self.method).finish()
    }
}

impl Cryptor {
    /// Resolve `method` in the registry and construct its cipher
    pub fn new(method: &str, key: &str, kind: TransportKind) -> Result<Self, CryptoError> {
        let inner = CipherRegistry::global().construct(method, key, kind)?;
        Ok(Self {
            method: method.to_ascii_lowercase(),
            inner,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Bytes {
        self.inner.encrypt(plaintext)
    }

    /// Any failure here is fatal for the connection
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Bytes, CryptoError> {
        self.inner.decrypt(ciphertext)
    }
}
