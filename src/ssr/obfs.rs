use bytes::{Buf, BufMut, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt::Write as _;
use std::io;
use std::str::FromStr;

use super::{PluginData, ServerInfo, SsrError};

/// Obfuscation layer: outermost transform, applied after the stream cipher.
pub trait Obfs: Send + Sync {
    fn name(&self) -> &'static str;

    fn set_server_info(&mut self, info: ServerInfo);

    /// Fresh session state for a dialer that has none yet.
    fn data(&self) -> PluginData;

    fn set_data(&mut self, data: PluginData);

    /// client -> server
    fn encode(&mut self, data: &[u8], out: &mut BytesMut);

    /// server -> client
    fn decode(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()>;
}

/// Obfuscation plugins selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsKind {
    Plain,
    HttpSimple,
    HttpPost,
}

impl ObfsKind {
    pub fn name(&self) -> &'static str {
        match self {
            ObfsKind::Plain => "plain",
            ObfsKind::HttpSimple => "http_simple",
            ObfsKind::HttpPost => "http_post",
        }
    }

    pub fn build(&self) -> Box<dyn Obfs> {
        match self {
            ObfsKind::Plain => Box::new(PlainObfs),
            ObfsKind::HttpSimple => Box::new(HttpObfs::new(HttpMethod::Get)),
            ObfsKind::HttpPost => Box::new(HttpObfs::new(HttpMethod::Post)),
        }
    }
}

impl FromStr for ObfsKind {
    type Err = SsrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "none" | "" => Ok(ObfsKind::Plain),
            "http_simple" | "http_simple_compatible" => Ok(ObfsKind::HttpSimple),
            "http_post" | "http_post_compatible" => Ok(ObfsKind::HttpPost),
            _ => Err(SsrError::UnsupportedObfs(s.to_string())),
        }
    }
}

/// Plain (no obfuscation).
pub struct PlainObfs;

impl Obfs for PlainObfs {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn set_server_info(&mut self, _info: ServerInfo) {}

    fn data(&self) -> PluginData {
        PluginData::None
    }

    fn set_data(&mut self, _data: PluginData) {}

    fn encode(&mut self, data: &[u8], out: &mut BytesMut) {
        out.put_slice(data);
    }

    fn decode(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        out.put_slice(data);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMethod {
    Get,
    Post,
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/40.0",
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/44.0",
    "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2228.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:40.0) Gecko/20100101 Firefox/40.0",
    "Mozilla/5.0 (compatible; MSIE 9.0; Windows NT 6.1; Trident/5.0)",
    "Mozilla/5.0 (Linux; Android 4.4; Nexus 5 Build/BuildID) AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 Chrome/30.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPad; CPU OS 5_0 like Mac OS X) AppleWebKit/534.46 (KHTML, like Gecko) Version/5.1 Mobile/9A334 Safari/7534.48.3",
];

const ACCEPT_HEADERS: &str = "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
Accept-Language: en-US,en;q=0.8\r\n\
Accept-Encoding: gzip, deflate\r\n";

/// `http_simple` / `http_post`: disguise the first request as an HTTP request
/// whose path carries the head of the payload, and strip the first response
/// header from the server.
pub struct HttpObfs {
    method: HttpMethod,
    info: ServerInfo,
    sent_header: bool,
    recv_header: bool,
    pending: BytesMut,
}

impl HttpObfs {
    fn new(method: HttpMethod) -> Self {
        Self {
            method,
            info: ServerInfo::default(),
            sent_header: false,
            recv_header: false,
            pending: BytesMut::new(),
        }
    }

    fn request_head(&self, head: &[u8]) -> String {
        let mut rng = rand::thread_rng();

        let configured = if self.info.param.is_empty() {
            self.info.host.as_str()
        } else {
            self.info.param.as_str()
        };
        let (hosts, custom) = match configured.split_once('#') {
            Some((hosts, custom)) => (hosts, Some(custom.replace("\\n", "\r\n").replace('\n', "\r\n"))),
            None => (configured, None),
        };
        let candidates: Vec<&str> = hosts.split(',').map(str::trim).filter(|h| !h.is_empty()).collect();
        let host = candidates.choose(&mut rng).copied().unwrap_or(self.info.host.as_str());

        let verb = match self.method {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        };

        let mut req = String::with_capacity(256 + head.len() * 3);
        req.push_str(verb);
        req.push_str(" /");
        for b in head {
            let _ = write!(req, "%{:02x}", b);
        }
        req.push_str(" HTTP/1.1\r\nHost: ");
        req.push_str(host);
        if self.info.port != 80 {
            let _ = write!(req, ":{}", self.info.port);
        }
        req.push_str("\r\n");

        match custom {
            Some(custom) => {
                req.push_str(&custom);
                req.push_str("\r\n\r\n");
            }
            None => {
                let ua = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
                let _ = write!(req, "User-Agent: {}\r\n", ua);
                req.push_str(ACCEPT_HEADERS);
                if self.method == HttpMethod::Post {
                    let _ = write!(req, "Content-Type: multipart/form-data; boundary={}\r\n", boundary(&mut rng));
                }
                req.push_str("DNT: 1\r\nConnection: keep-alive\r\n\r\n");
            }
        }
        req
    }
}

fn boundary(rng: &mut impl Rng) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut s = String::from("----WebKitFormBoundary");
    for _ in 0..16 {
        s.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    s
}

impl Obfs for HttpObfs {
    fn name(&self) -> &'static str {
        match self.method {
            HttpMethod::Get => "http_simple",
            HttpMethod::Post => "http_post",
        }
    }

    fn set_server_info(&mut self, info: ServerInfo) {
        self.info = info;
    }

    fn data(&self) -> PluginData {
        PluginData::None
    }

    fn set_data(&mut self, _data: PluginData) {}

    fn encode(&mut self, data: &[u8], out: &mut BytesMut) {
        if self.sent_header {
            out.put_slice(data);
            return;
        }

        let head_size = self.info.iv.len() + self.info.head_len;
        let head_len = if data.len() > head_size + 64 {
            head_size + rand::thread_rng().gen_range(0..=64)
        } else {
            data.len()
        };

        let (head, body) = data.split_at(head_len);
        out.put_slice(self.request_head(head).as_bytes());
        out.put_slice(body);
        self.sent_header = true;
    }

    fn decode(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        if self.recv_header {
            out.put_slice(data);
            return Ok(());
        }

        self.pending.put_slice(data);
        if let Some(pos) = self.pending.windows(4).position(|w| w == b"\r\n\r\n") {
            self.pending.advance(pos + 4);
            out.put_slice(&self.pending);
            self.pending.clear();
            self.recv_header = true;
        } else if self.pending.len() > 64 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "obfs response header too large",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(param: &str, port: u16) -> ServerInfo {
        ServerInfo {
            host: "10.0.0.1".to_string(),
            port,
            param: param.to_string(),
            head_len: 7,
            ..ServerInfo::default()
        }
    }

    fn percent_decode(path: &str) -> Vec<u8> {
        path.split('%')
            .filter(|s| !s.is_empty())
            .map(|h| u8::from_str_radix(h, 16).unwrap())
            .collect()
    }

    #[test]
    fn names_resolve() {
        assert_eq!("http_simple".parse::<ObfsKind>().unwrap(), ObfsKind::HttpSimple);
        assert_eq!("PLAIN".parse::<ObfsKind>().unwrap(), ObfsKind::Plain);
        assert!(matches!("tls1.2_ticket_fastauth".parse::<ObfsKind>(), Err(SsrError::UnsupportedObfs(_))));
        assert_eq!(ObfsKind::HttpPost.build().name(), "http_post");
    }

    #[test]
    fn http_simple_wraps_first_packet_only() {
        let mut obfs = ObfsKind::HttpSimple.build();
        obfs.set_server_info(info("cdn.example.com", 8388));

        let payload: Vec<u8> = (0..200u8).collect();
        let mut out = BytesMut::new();
        obfs.encode(&payload, &mut out);

        let text = String::from_utf8_lossy(&out).into_owned();
        assert!(text.starts_with("GET /%00%01%02"));
        assert!(text.contains("\r\nHost: cdn.example.com:8388\r\n"));
        assert!(text.contains("User-Agent: "));

        let header_end = out.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let request_line = text.lines().next().unwrap();
        let path = request_line.split(' ').nth(1).unwrap().trim_start_matches('/');
        let mut rebuilt = percent_decode(path);
        rebuilt.extend_from_slice(&out[header_end..]);
        assert_eq!(rebuilt, payload);

        let mut second = BytesMut::new();
        obfs.encode(b"more", &mut second);
        assert_eq!(&second[..], b"more");
    }

    #[test]
    fn http_post_uses_custom_headers_and_default_port() {
        let mut obfs = ObfsKind::HttpPost.build();
        obfs.set_server_info(info("a.com,b.com#X-Test: 1\\nX-Other: 2", 80));

        let mut out = BytesMut::new();
        obfs.encode(b"abc", &mut out);
        let text = String::from_utf8_lossy(&out).into_owned();

        assert!(text.starts_with("POST /%61%62%63 HTTP/1.1\r\n"));
        assert!(text.contains("Host: a.com\r\n") || text.contains("Host: b.com\r\n"));
        assert!(text.ends_with("X-Test: 1\r\nX-Other: 2\r\n\r\n"));
        assert!(!text.contains("User-Agent"));
    }

    #[test]
    fn decode_strips_split_response_header() {
        let mut obfs = ObfsKind::HttpSimple.build();
        let mut out = BytesMut::new();
        obfs.decode(b"HTTP/1.1 200 OK\r\nContent-", &mut out).unwrap();
        assert!(out.is_empty());
        obfs.decode(b"Type: text/html\r\n\r\npayload", &mut out).unwrap();
        assert_eq!(&out[..], b"payload");
        obfs.decode(b"\r\n\r\nraw", &mut out).unwrap();
        assert_eq!(&out[..], b"payload\r\n\r\nraw");
    }
}
