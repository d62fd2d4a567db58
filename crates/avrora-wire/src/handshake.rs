//! Handshake request and response records, per the Avro protocol spec.
//!
//! ```text
//! HandshakeRequest  {clientHash: fixed(16), clientProtocol: union{null,string},
//!                    serverHash: fixed(16), meta: union{null,map<bytes>}}
//! HandshakeResponse {match: enum{BOTH,CLIENT,NONE},
//!                    serverProtocol: union{null,string},
//!                    serverHash: union{null,fixed(16)},
//!                    meta: union{null,map<bytes>}}
//! ```

use avrora_schema::{cursor, Cursor};

use crate::{read_meta, write_meta, WireError};

/// Meta map key whose UTF-8 value explains a fatal `NONE` response.
pub const META_ERROR_KEY: &str = "error";

/// Outcome of a handshake round, in enum declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// Server knows both protocols; no further negotiation needed.
    Both,
    /// Server knows the client protocol; response carries server data.
    Client,
    /// Server needs the client protocol text, or negotiation failed.
    None,
}

impl HandshakeMatch {
    fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(HandshakeMatch::Both),
            1 => Some(HandshakeMatch::Client),
            2 => Some(HandshakeMatch::None),
            _ => None,
        }
    }

    fn index(self) -> i32 {
        match self {
            HandshakeMatch::Both => 0,
            HandshakeMatch::Client => 1,
            HandshakeMatch::None => 2,
        }
    }
}

impl std::fmt::Display for HandshakeMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HandshakeMatch::Both => "BOTH",
            HandshakeMatch::Client => "CLIENT",
            HandshakeMatch::None => "NONE",
        })
    }
}

/// First message an emitter sends on a fresh session.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub client_hash: [u8; 16],
    /// Omitted on the first attempt to keep the exchange small; filled in
    /// when the server answers `NONE` without an error.
    pub client_protocol: Option<String>,
    pub server_hash: [u8; 16],
    pub meta: Vec<(String, Vec<u8>)>,
}

impl HandshakeRequest {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.client_hash);
        write_optional_string(buf, self.client_protocol.as_deref());
        buf.extend_from_slice(&self.server_hash);
        write_optional_meta(buf, &self.meta);
    }

    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let client_hash = read_hash(cur)?;
        let client_protocol = read_optional_string(cur)?;
        let server_hash = read_hash(cur)?;
        let meta = read_optional_meta(cur)?;
        Ok(Self {
            client_hash,
            client_protocol,
            server_hash,
            meta,
        })
    }
}

/// First message a listener sends back.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    pub match_: HandshakeMatch,
    pub server_protocol: Option<String>,
    pub server_hash: Option<[u8; 16]>,
    pub meta: Vec<(String, Vec<u8>)>,
}

impl HandshakeResponse {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        cursor::write_int(buf, self.match_.index());
        write_optional_string(buf, self.server_protocol.as_deref());
        match &self.server_hash {
            None => cursor::write_long(buf, 0),
            Some(hash) => {
                cursor::write_long(buf, 1);
                buf.extend_from_slice(hash);
            }
        }
        write_optional_meta(buf, &self.meta);
    }

    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let index = cur.read_long()?;
        let match_ = HandshakeMatch::from_index(index)
            .ok_or_else(|| WireError::InvalidHandshake(format!("bad match index {index}")))?;
        let server_protocol = read_optional_string(cur)?;
        let server_hash = match read_union_index(cur)? {
            0 => None,
            _ => Some(read_hash(cur)?),
        };
        let meta = read_optional_meta(cur)?;
        Ok(Self {
            match_,
            server_protocol,
            server_hash,
            meta,
        })
    }

    /// The UTF-8 content of the `error` meta entry, if present.
    pub fn meta_error(&self) -> Option<String> {
        self.meta
            .iter()
            .find(|(k, _)| k == META_ERROR_KEY)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
    }
}

fn read_hash(cur: &mut Cursor<'_>) -> Result<[u8; 16], WireError> {
    let bytes = cur.read_fixed(16)?;
    bytes
        .try_into()
        .map_err(|_| WireError::InvalidHandshake("short hash".to_string()))
}

fn read_union_index(cur: &mut Cursor<'_>) -> Result<i64, WireError> {
    let index = cur.read_long()?;
    if index == 0 || index == 1 {
        Ok(index)
    } else {
        Err(WireError::InvalidHandshake(format!(
            "bad union branch {index}"
        )))
    }
}

fn write_optional_string(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        None => cursor::write_long(buf, 0),
        Some(s) => {
            cursor::write_long(buf, 1);
            cursor::write_string(buf, s);
        }
    }
}

fn read_optional_string(cur: &mut Cursor<'_>) -> Result<Option<String>, WireError> {
    match read_union_index(cur)? {
        0 => Ok(None),
        _ => Ok(Some(cur.read_string()?)),
    }
}

fn write_optional_meta(buf: &mut Vec<u8>, meta: &[(String, Vec<u8>)]) {
    if meta.is_empty() {
        cursor::write_long(buf, 0);
    } else {
        cursor::write_long(buf, 1);
        write_meta(buf, meta);
    }
}

fn read_optional_meta(cur: &mut Cursor<'_>) -> Result<Vec<(String, Vec<u8>)>, WireError> {
    match read_union_index(cur)? {
        0 => Ok(Vec::new()),
        _ => Ok(read_meta(cur)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let request = HandshakeRequest {
            client_hash: [1; 16],
            client_protocol: Some("{\"protocol\":\"P\"}".to_string()),
            server_hash: [2; 16],
            meta: vec![("k".to_string(), vec![9])],
        };
        let mut buf = Vec::new();
        request.encode(&mut buf);
        let mut cur = Cursor::new(&buf);
        assert_eq!(HandshakeRequest::decode(&mut cur).unwrap(), request);
        assert!(cur.is_empty());
    }

    #[test]
    fn minimal_request_layout() {
        // hash || null || hash || null: exactly 16 + 1 + 16 + 1 bytes.
        let request = HandshakeRequest {
            client_hash: [0xAA; 16],
            client_protocol: None,
            server_hash: [0xBB; 16],
            meta: Vec::new(),
        };
        let mut buf = Vec::new();
        request.encode(&mut buf);
        assert_eq!(buf.len(), 34);
        assert_eq!(buf[16], 0); // null branch of clientProtocol
        assert_eq!(buf[33], 0); // null branch of meta
    }

    #[test]
    fn response_roundtrip() {
        let response = HandshakeResponse {
            match_: HandshakeMatch::Client,
            server_protocol: Some("{}".to_string()),
            server_hash: Some([3; 16]),
            meta: Vec::new(),
        };
        let mut buf = Vec::new();
        response.encode(&mut buf);
        let mut cur = Cursor::new(&buf);
        assert_eq!(HandshakeResponse::decode(&mut cur).unwrap(), response);
    }

    #[test]
    fn match_codes_follow_declaration_order() {
        for (code, byte) in [
            (HandshakeMatch::Both, 0x00),
            (HandshakeMatch::Client, 0x02),
            (HandshakeMatch::None, 0x04),
        ] {
            let response = HandshakeResponse {
                match_: code,
                server_protocol: None,
                server_hash: None,
                meta: Vec::new(),
            };
            let mut buf = Vec::new();
            response.encode(&mut buf);
            assert_eq!(buf[0], byte, "{code}");
        }
    }

    #[test]
    fn meta_error_is_surfaced() {
        let response = HandshakeResponse {
            match_: HandshakeMatch::None,
            server_protocol: None,
            server_hash: None,
            meta: vec![(META_ERROR_KEY.to_string(), b"one-way mismatch".to_vec())],
        };
        assert_eq!(response.meta_error().as_deref(), Some("one-way mismatch"));
    }

    #[test]
    fn undecodable_request_errors() {
        let mut cur = Cursor::new(&[1, 2, 3]);
        assert!(HandshakeRequest::decode(&mut cur).is_err());
    }
}
