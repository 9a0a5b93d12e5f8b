use aes::{Aes128, Aes192, Aes256};
use bytes::{BufMut, BytesMut};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use md5::{Digest, Md5};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

use super::{SsrError, SsrResult};

/// Supported stream ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    None,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
}

impl CipherKind {
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::None => "none",
            CipherKind::Aes128Cfb => "aes-128-cfb",
            CipherKind::Aes192Cfb => "aes-192-cfb",
            CipherKind::Aes256Cfb => "aes-256-cfb",
        }
    }

    /// Derived key length. `none` still derives a 16-byte key for protocol plugins.
    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::None | CipherKind::Aes128Cfb => 16,
            CipherKind::Aes192Cfb => 24,
            CipherKind::Aes256Cfb => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherKind::None => 0,
            _ => 16,
        }
    }
}

impl FromStr for CipherKind {
    type Err = SsrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "plain" | "dummy" => Ok(CipherKind::None),
            "aes-128-cfb" => Ok(CipherKind::Aes128Cfb),
            "aes-192-cfb" => Ok(CipherKind::Aes192Cfb),
            "aes-256-cfb" => Ok(CipherKind::Aes256Cfb),
            _ => Err(SsrError::UnsupportedCipher(s.to_string())),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5 and a single iteration, no salt.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

enum Encryptor {
    Aes128(BufEncryptor<Aes128>),
    Aes192(BufEncryptor<Aes192>),
    Aes256(BufEncryptor<Aes256>),
}

impl Encryptor {
    fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> SsrResult<Option<Self>> {
        let err = |e: cfb_mode::cipher::InvalidLength| SsrError::Cipher(format!("{}: {}", kind, e));
        Ok(match kind {
            CipherKind::None => None,
            CipherKind::Aes128Cfb => Some(Encryptor::Aes128(BufEncryptor::new_from_slices(key, iv).map_err(err)?)),
            CipherKind::Aes192Cfb => Some(Encryptor::Aes192(BufEncryptor::new_from_slices(key, iv).map_err(err)?)),
            CipherKind::Aes256Cfb => Some(Encryptor::Aes256(BufEncryptor::new_from_slices(key, iv).map_err(err)?)),
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Encryptor::Aes128(c) => c.encrypt(data),
            Encryptor::Aes192(c) => c.encrypt(data),
            Encryptor::Aes256(c) => c.encrypt(data),
        }
    }
}

enum Decryptor {
    Aes128(BufDecryptor<Aes128>),
    Aes192(BufDecryptor<Aes192>),
    Aes256(BufDecryptor<Aes256>),
}

impl Decryptor {
    fn new(kind: CipherKind, key: &[u8], iv: &[u8]) -> SsrResult<Option<Self>> {
        let err = |e: cfb_mode::cipher::InvalidLength| SsrError::Cipher(format!("{}: {}", kind, e));
        Ok(match kind {
            CipherKind::None => None,
            CipherKind::Aes128Cfb => Some(Decryptor::Aes128(BufDecryptor::new_from_slices(key, iv).map_err(err)?)),
            CipherKind::Aes192Cfb => Some(Decryptor::Aes192(BufDecryptor::new_from_slices(key, iv).map_err(err)?)),
            CipherKind::Aes256Cfb => Some(Decryptor::Aes256(BufDecryptor::new_from_slices(key, iv).map_err(err)?)),
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Decryptor::Aes128(c) => c.decrypt(data),
            Decryptor::Aes192(c) => c.decrypt(data),
            Decryptor::Aes256(c) => c.decrypt(data),
        }
    }
}

/// Per-connection stream cipher state.
///
/// The encryption IV is generated up front so protocol plugins can key their
/// MACs with it; it is emitted ahead of the first ciphertext. The peer's IV is
/// taken from the first `iv_len` bytes received.
pub struct StreamCipher {
    kind: CipherKind,
    key: Vec<u8>,
    iv: Vec<u8>,
    iv_sent: bool,
    encryptor: Option<Encryptor>,
    decryptor: Option<Decryptor>,
    peer_iv: Vec<u8>,
}

impl StreamCipher {
    pub fn new(kind: CipherKind, password: &str) -> SsrResult<Self> {
        let key = evp_bytes_to_key(password.as_bytes(), kind.key_len());
        let mut iv = vec![0u8; kind.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        Self::with_iv(kind, key, iv)
    }

    fn with_iv(kind: CipherKind, key: Vec<u8>, iv: Vec<u8>) -> SsrResult<Self> {
        let encryptor = Encryptor::new(kind, &key, &iv)?;
        Ok(Self {
            kind,
            key,
            iv,
            iv_sent: false,
            encryptor,
            decryptor: None,
            peer_iv: Vec::new(),
        })
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Local encryption IV
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn encrypt(&mut self, data: &[u8], out: &mut BytesMut) {
        if !self.iv_sent {
            out.put_slice(&self.iv);
            self.iv_sent = true;
        }
        let start = out.len();
        out.put_slice(data);
        if let Some(enc) = self.encryptor.as_mut() {
            enc.apply(&mut out[start..]);
        }
    }

    pub fn decrypt(&mut self, mut data: &[u8], out: &mut BytesMut) -> SsrResult<()> {
        let iv_len = self.kind.iv_len();
        if self.peer_iv.len() < iv_len {
            let take = (iv_len - self.peer_iv.len()).min(data.len());
            self.peer_iv.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.peer_iv.len() < iv_len {
                return Ok(());
            }
            self.decryptor = Decryptor::new(self.kind, &self.key, &self.peer_iv)?;
        }

        let start = out.len();
        out.put_slice(data);
        if let Some(dec) = self.decryptor.as_mut() {
            dec.apply(&mut out[start..]);
        }
        Ok(())
    }
}

impl fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCipher")
            .field("kind", &self.kind)
            .field("iv_sent", &self.iv_sent)
            .finish()
    }
}
