use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use base64::Engine;
use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use sha1::Sha1;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::cipher::evp_bytes_to_key;
use super::{AuthData, PluginData, ServerInfo, SsrError};

/// Protocol layer: innermost transform, applied to plaintext before the stream
/// cipher on the way out and after it on the way in.
pub trait Protocol: Send + Sync {
    fn name(&self) -> &'static str;

    fn set_server_info(&mut self, info: ServerInfo);

    /// Fresh session state for a dialer that has none yet.
    fn data(&self) -> PluginData;

    fn set_data(&mut self, data: PluginData);

    fn pre_encrypt(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()>;

    fn post_decrypt(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()>;
}

/// Protocol plugins selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Origin,
    AuthAes128Md5,
    AuthAes128Sha1,
}

impl ProtocolKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolKind::Origin => "origin",
            ProtocolKind::AuthAes128Md5 => "auth_aes128_md5",
            ProtocolKind::AuthAes128Sha1 => "auth_aes128_sha1",
        }
    }

    pub fn build(&self) -> Box<dyn Protocol> {
        match self {
            ProtocolKind::Origin => Box::new(OriginProtocol),
            ProtocolKind::AuthAes128Md5 => Box::new(AuthAes128::new(AuthHash::Md5)),
            ProtocolKind::AuthAes128Sha1 => Box::new(AuthAes128::new(AuthHash::Sha1)),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = SsrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "origin" | "plain" | "" => Ok(ProtocolKind::Origin),
            "auth_aes128_md5" => Ok(ProtocolKind::AuthAes128Md5),
            "auth_aes128_sha1" => Ok(ProtocolKind::AuthAes128Sha1),
            _ => Err(SsrError::UnsupportedProtocol(s.to_string())),
        }
    }
}

/// Origin (no protocol overhead).
pub struct OriginProtocol;

impl Protocol for OriginProtocol {
    fn name(&self) -> &'static str {
        "origin"
    }

    fn set_server_info(&mut self, _info: ServerInfo) {}

    fn data(&self) -> PluginData {
        PluginData::None
    }

    fn set_data(&mut self, _data: PluginData) {}

    fn pre_encrypt(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        out.put_slice(data);
        Ok(())
    }

    fn post_decrypt(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        out.put_slice(data);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthHash {
    Md5,
    Sha1,
}

impl AuthHash {
    fn salt(&self) -> &'static str {
        match self {
            AuthHash::Md5 => "auth_aes128_md5",
            AuthHash::Sha1 => "auth_aes128_sha1",
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            AuthHash::Md5 => Md5::digest(data).to_vec(),
            AuthHash::Sha1 => Sha1::digest(data).to_vec(),
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> io::Result<Vec<u8>> {
        let bad_key = |_| io::Error::new(io::ErrorKind::InvalidInput, "invalid hmac key length");
        Ok(match self {
            AuthHash::Md5 => {
                let mut mac = <Hmac<Md5> as Mac>::new_from_slice(key).map_err(bad_key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            AuthHash::Sha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).map_err(bad_key)?;
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        })
    }
}

/// Largest plaintext carried by one framed packet.
const UNIT_LEN: usize = 8100;
/// First packet carries at most this much payload after the auth header.
const AUTH_PAYLOAD_LEN: usize = 1200;
const MAX_PACKET_LEN: usize = 8192;

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// `auth_aes128_md5` / `auth_aes128_sha1`.
///
/// Client packets are `len(2) | hmac(len)[..2] | rnd | data | hmac(all)[..4]`,
/// keyed with `user_key ‖ pack_id`. The first packet is preceded by the auth
/// header carrying the AES-encrypted session identity.
pub struct AuthAes128 {
    hash: AuthHash,
    info: ServerInfo,
    data: Arc<Mutex<AuthData>>,
    uid: Option<u32>,
    user_key: Vec<u8>,
    has_sent_header: bool,
    pack_id: u32,
    recv_id: u32,
    recv_buf: BytesMut,
}

impl AuthAes128 {
    fn new(hash: AuthHash) -> Self {
        Self {
            hash,
            info: ServerInfo::default(),
            data: Arc::new(Mutex::new(AuthData::new())),
            uid: None,
            user_key: Vec::new(),
            has_sent_header: false,
            pack_id: 1,
            recv_id: 1,
            recv_buf: BytesMut::new(),
        }
    }

    fn keyed(&self, id: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.user_key.len() + 4);
        key.extend_from_slice(&self.user_key);
        key.extend_from_slice(&id.to_le_bytes());
        key
    }

    fn pack_auth_data(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let mut rng = rand::thread_rng();
        let rand_len = if data.len() > 400 {
            rng.gen_range(0..512)
        } else {
            rng.gen_range(0..1024)
        };
        let data_offset = rand_len + 16 + 4 + 4 + 7;
        let out_len = data_offset + data.len() + 4;

        let mut packet = vec![0u8; out_len];
        rng.fill_bytes(&mut packet[data_offset - rand_len..data_offset]);

        let (client_id, connection_id) = self.data.lock().next_connection();
        let utc = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        let mut plain = [0u8; 16];
        plain[0..4].copy_from_slice(&utc.to_le_bytes());
        plain[4..8].copy_from_slice(&client_id);
        plain[8..12].copy_from_slice(&connection_id.to_le_bytes());
        plain[12..14].copy_from_slice(&(out_len as u16).to_le_bytes());
        plain[14..16].copy_from_slice(&(rand_len as u16).to_le_bytes());

        let uid = self.uid.unwrap_or_else(|| rng.gen());
        let encoded_key = base64::engine::general_purpose::STANDARD.encode(&self.user_key);
        let aes_key = evp_bytes_to_key(format!("{}{}", encoded_key, self.hash.salt()).as_bytes(), 16);
        let aes = <Aes128 as KeyInit>::new_from_slice(&aes_key)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid aes key length"))?;
        let mut block = aes::Block::clone_from_slice(&plain);
        aes.encrypt_block(&mut block);

        let mut mac_key = Vec::with_capacity(self.info.iv.len() + self.info.key.len());
        mac_key.extend_from_slice(&self.info.iv);
        mac_key.extend_from_slice(&self.info.key);

        let mut header = [0u8; 24];
        header[0..4].copy_from_slice(&uid.to_le_bytes());
        header[4..20].copy_from_slice(&block);
        let h = self.hash.hmac(&mac_key, &header[..20])?;
        header[20..24].copy_from_slice(&h[..4]);

        packet[0] = rng.gen();
        let h = self.hash.hmac(&mac_key, &packet[..1])?;
        packet[1..7].copy_from_slice(&h[..6]);
        packet[7..31].copy_from_slice(&header);
        packet[data_offset..data_offset + data.len()].copy_from_slice(data);

        let h = self.hash.hmac(&self.user_key, &packet[..out_len - 4])?;
        packet[out_len - 4..].copy_from_slice(&h[..4]);

        out.put_slice(&packet);
        Ok(())
    }

    fn pack_data(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let mut rng = rand::thread_rng();
        let mut rand_len = 1;
        if data.len() <= AUTH_PAYLOAD_LEN {
            rand_len += if self.pack_id > 4 {
                rng.gen_range(0..32)
            } else if data.len() > 900 {
                rng.gen_range(0..128)
            } else {
                rng.gen_range(0..512)
            };
        }
        let out_len = rand_len + data.len() + 8;
        let key = self.keyed(self.pack_id);

        let mut packet = vec![0u8; out_len];
        packet[0..2].copy_from_slice(&(out_len as u16).to_le_bytes());
        let h = self.hash.hmac(&key, &packet[..2])?;
        packet[2..4].copy_from_slice(&h[..2]);

        rng.fill_bytes(&mut packet[4..4 + rand_len]);
        if rand_len < 128 {
            packet[4] = rand_len as u8;
        } else {
            packet[4] = 0xFF;
            packet[5..7].copy_from_slice(&(rand_len as u16).to_le_bytes());
        }
        packet[4 + rand_len..out_len - 4].copy_from_slice(data);

        self.pack_id = self.pack_id.wrapping_add(1);
        let h = self.hash.hmac(&key, &packet[..out_len - 4])?;
        packet[out_len - 4..].copy_from_slice(&h[..4]);

        out.put_slice(&packet);
        Ok(())
    }
}

impl Protocol for AuthAes128 {
    fn name(&self) -> &'static str {
        self.hash.salt()
    }

    /// A `uid:password` param authenticates as that user; otherwise the cipher
    /// key doubles as the user key and the uid is random.
    fn set_server_info(&mut self, info: ServerInfo) {
        self.uid = None;
        self.user_key = info.key.clone();
        if let Some((uid, password)) = info.param.split_once(':') {
            if let Ok(uid) = uid.trim().parse::<u32>() {
                self.uid = Some(uid);
                self.user_key = self.hash.digest(password.as_bytes());
            }
        }
        self.info = info;
    }

    fn data(&self) -> PluginData {
        PluginData::Auth(self.data.clone())
    }

    fn set_data(&mut self, data: PluginData) {
        if let PluginData::Auth(data) = data {
            self.data = data;
        }
    }

    fn pre_encrypt(&mut self, mut data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        if !self.has_sent_header {
            let n = data.len().min(AUTH_PAYLOAD_LEN);
            self.pack_auth_data(&data[..n], out)?;
            self.has_sent_header = true;
            data = &data[n..];
        }
        while data.len() > UNIT_LEN {
            self.pack_data(&data[..UNIT_LEN], out)?;
            data = &data[UNIT_LEN..];
        }
        if !data.is_empty() {
            self.pack_data(data, out)?;
        }
        Ok(())
    }

    fn post_decrypt(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        self.recv_buf.put_slice(data);
        while self.recv_buf.len() > 4 {
            let key = self.keyed(self.recv_id);
            let h = self.hash.hmac(&key, &self.recv_buf[..2])?;
            if h[..2] != self.recv_buf[2..4] {
                return Err(invalid("auth_aes128: length hmac mismatch"));
            }
            let length = u16::from_le_bytes([self.recv_buf[0], self.recv_buf[1]]) as usize;
            if !(8..MAX_PACKET_LEN).contains(&length) {
                return Err(invalid("auth_aes128: bad packet length"));
            }
            if length > self.recv_buf.len() {
                break;
            }

            let h = self.hash.hmac(&key, &self.recv_buf[..length - 4])?;
            if h[..4] != self.recv_buf[length - 4..length] {
                return Err(invalid("auth_aes128: packet hmac mismatch"));
            }
            self.recv_id = self.recv_id.wrapping_add(1);

            let pos = if self.recv_buf[4] < 0xFF {
                self.recv_buf[4] as usize + 4
            } else {
                u16::from_le_bytes([self.recv_buf[5], self.recv_buf[6]]) as usize + 4
            };
            if pos > length - 4 {
                return Err(invalid("auth_aes128: bad padding length"));
            }
            out.put_slice(&self.recv_buf[pos..length - 4]);
            self.recv_buf.advance(length);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockDecrypt;

    fn info(param: &str) -> ServerInfo {
        ServerInfo {
            host: "10.0.0.1".to_string(),
            port: 8388,
            param: param.to_string(),
            iv: vec![7u8; 16],
            key: evp_bytes_to_key(b"secret", 16),
            head_len: 7,
            ..ServerInfo::default()
        }
    }

    fn auth(kind: ProtocolKind, param: &str) -> Box<dyn Protocol> {
        let mut p = kind.build();
        p.set_server_info(info(param));
        p
    }

    #[test]
    fn names_resolve() {
        assert_eq!("auth_aes128_md5".parse::<ProtocolKind>().unwrap(), ProtocolKind::AuthAes128Md5);
        assert_eq!("origin".parse::<ProtocolKind>().unwrap(), ProtocolKind::Origin);
        assert!(matches!(
            "auth_chain_a".parse::<ProtocolKind>(),
            Err(SsrError::UnsupportedProtocol(_))
        ));
        assert_eq!(ProtocolKind::AuthAes128Sha1.build().name(), "auth_aes128_sha1");
    }

    #[test]
    fn origin_is_identity() {
        let mut p = ProtocolKind::Origin.build();
        let mut out = BytesMut::new();
        p.pre_encrypt(b"abc", &mut out).unwrap();
        p.post_decrypt(b"def", &mut out).unwrap();
        assert_eq!(&out[..], b"abcdef");
        assert!(matches!(p.data(), PluginData::None));
    }

    #[test]
    fn packets_verify_on_the_receiving_side() {
        for kind in [ProtocolKind::AuthAes128Md5, ProtocolKind::AuthAes128Sha1] {
            let mut sender = AuthAes128::new(if kind == ProtocolKind::AuthAes128Md5 {
                AuthHash::Md5
            } else {
                AuthHash::Sha1
            });
            sender.set_server_info(info("42:userpass"));
            let mut receiver = auth(kind, "42:userpass");

            let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
            let mut wire = BytesMut::new();
            for chunk in payload.chunks(3000) {
                sender.pack_data(chunk, &mut wire).unwrap();
            }

            // deliver in small, unaligned pieces
            let mut got = BytesMut::new();
            for piece in wire.chunks(37) {
                receiver.post_decrypt(piece, &mut got).unwrap();
            }
            assert_eq!(&got[..], &payload[..]);
        }
    }

    #[test]
    fn tampered_packet_is_rejected() {
        let mut sender = AuthAes128::new(AuthHash::Md5);
        sender.set_server_info(info(""));
        let mut receiver = auth(ProtocolKind::AuthAes128Md5, "");

        let mut wire = BytesMut::new();
        sender.pack_data(b"hello", &mut wire).unwrap();
        let last = wire.len() - 5;
        wire[last] ^= 0x01;

        let err = receiver.post_decrypt(&wire, &mut BytesMut::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn first_packet_carries_auth_header() {
        let mut p = AuthAes128::new(AuthHash::Md5);
        p.set_server_info(info("42:userpass"));
        let handle = match p.data() {
            PluginData::Auth(handle) => handle,
            PluginData::None => panic!("auth plugin must expose session state"),
        };
        let before = handle.lock().connection_id;

        let mut out = BytesMut::new();
        p.pre_encrypt(b"target", &mut out).unwrap();

        let user_key = Md5::digest(b"userpass").to_vec();
        assert_eq!(u32::from_le_bytes(out[7..11].try_into().unwrap()), 42);

        let mac_key = [vec![7u8; 16], evp_bytes_to_key(b"secret", 16)].concat();
        let check = AuthHash::Md5.hmac(&mac_key, &out[..1]).unwrap();
        assert_eq!(&out[1..7], &check[..6]);

        let encoded = base64::engine::general_purpose::STANDARD.encode(&user_key);
        let aes_key = evp_bytes_to_key(format!("{}auth_aes128_md5", encoded).as_bytes(), 16);
        let aes = <Aes128 as KeyInit>::new_from_slice(&aes_key).unwrap();
        let mut block = aes::Block::clone_from_slice(&out[11..27]);
        aes.decrypt_block(&mut block);

        let after = handle.lock().connection_id;
        assert_eq!(after, before.wrapping_add(1));
        assert_eq!(u32::from_le_bytes(block[8..12].try_into().unwrap()), after);
        assert_eq!(u16::from_le_bytes([block[12], block[13]]) as usize, out.len());

        let rand_len = u16::from_le_bytes([block[14], block[15]]) as usize;
        let data_offset = rand_len + 31;
        assert_eq!(&out[data_offset..data_offset + 6], b"target");

        let tail = AuthHash::Md5.hmac(&user_key, &out[..out.len() - 4]).unwrap();
        assert_eq!(&out[out.len() - 4..], &tail[..4]);

        // later writes are plain framed packets
        let mut next = BytesMut::new();
        p.pre_encrypt(b"more", &mut next).unwrap();
        assert_eq!(u16::from_le_bytes([next[0], next[1]]) as usize, next.len());
    }

    #[test]
    fn shared_session_state_advances_per_connection() {
        let mut first = ProtocolKind::AuthAes128Sha1.build();
        first.set_server_info(info(""));
        let shared = first.data();

        let mut second = ProtocolKind::AuthAes128Sha1.build();
        second.set_server_info(info(""));
        second.set_data(shared.clone());

        let PluginData::Auth(handle) = shared else {
            panic!("auth plugin must expose session state");
        };
        let start = handle.lock().connection_id;

        first.pre_encrypt(b"a", &mut BytesMut::new()).unwrap();
        second.pre_encrypt(b"b", &mut BytesMut::new()).unwrap();
        assert_eq!(handle.lock().connection_id, start.wrapping_add(2));
    }
}
