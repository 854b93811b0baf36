//! Wire grammar.
//!
//! The protocol is a fixed single-byte code table over two transports: a
//! length-prefixed reliable stream and a datagram channel with its own
//! acknowledgement grammar. This module owns the grammar only; framing and
//! compression live in [`crate::codec`], transport code in the server crate.

use std::fmt;

/// Version string expected from connecting clients (`VC` frame).
pub const CLIENT_VERSION: &str = "2.0";

/// Version string reported to the discovery backend.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Packet codes carried as the first payload byte of the reliable stream.
pub mod codes {
    /// Handshake-complete signal; the reply carries the session id.
    pub const WORLD_READY: u8 = b'P';
    /// Heartbeat; echoed back and refreshes the player list.
    pub const PING: u8 = b'p';
    /// Vehicle sub-protocol (sub-code at index 1).
    pub const VEHICLE: u8 = b'O';
    /// Chat line `C:<name>:<text>`.
    pub const CHAT: u8 = b'C';
    /// Custom event `E:<name>:<data>`.
    pub const EVENT: u8 = b'E';
    /// Join announcement, relayed verbatim.
    pub const JOIN: u8 = b'J';
    /// High-frequency world data; counted into the packet-rate statistic.
    pub const WORLD_FIRST: u8 = b'V';
    pub const WORLD_LAST: u8 = b'Z';
}

/// Payloads at most this long travel as a single reliable datagram; longer
/// ones are split into chunks of this size.
pub const CHUNK_LEN: usize = 1000;

/// Outbound datagrams strictly longer than this are deflated (`ABG:`).
pub const UDP_COMPRESS_MIN: usize = 400;

/// Retransmission attempts before a pending datagram is dropped.
pub const RETRY_CAP: u32 = 20;

/// Per-session window of recently accepted datagram ids.
pub const DEDUPE_WINDOW: usize = 50;

/// Packet and split ids wrap at this bound.
pub const ID_ROLLOVER: u64 = 1_000_000;

/// Session identifier; the lowest free slot, reused after disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub u8);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// True for codes that always ride the reliable path even when the caller
/// asked for best-effort delivery.
pub fn forced_reliable(code: u8) -> bool {
    matches!(code, b'W' | b'Y' | b'V' | b'E')
}

/// True when a reliable payload must take the large-send path (chunked
/// reliable datagrams) instead of one stream frame.
pub fn wants_large(code: u8, len: usize) -> bool {
    code == b'O' || code == b'T' || len > CHUNK_LEN
}

/// True for the high-frequency world-data band `V`..=`Z`.
pub fn is_world_data(code: u8) -> bool {
    (codes::WORLD_FIRST..=codes::WORLD_LAST).contains(&code)
}

/// One datagram after the session prefix has been stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// `TRG:<pid>`: acknowledges a reliable datagram.
    Ack { pid: u64 },
    /// `BD:<pid>:<data>`: reliable single datagram.
    Single { pid: u64, data: Vec<u8> },
    /// `SC<seq>/<total>:<pid>|<sid>:<chunk>`: one chunk of a split.
    Chunk {
        seq: u32,
        total: u32,
        pid: u64,
        sid: u64,
        data: Vec<u8>,
    },
    /// Anything else: plain best-effort payload.
    Plain(Vec<u8>),
}

impl Datagram {
    /// Parses a datagram body. Returns `None` for a malformed reliable
    /// record (a protocol violation; the caller drops it silently).
    pub fn parse(raw: &[u8]) -> Option<Datagram> {
        if let Some(rest) = raw.strip_prefix(b"TRG:") {
            let pid = ascii_u64(rest)?;
            return Some(Datagram::Ack { pid });
        }
        if let Some(rest) = raw.strip_prefix(b"BD:") {
            let sep = rest.iter().position(|&b| b == b':')?;
            let pid = ascii_u64(&rest[..sep])?;
            return Some(Datagram::Single {
                pid,
                data: rest[sep + 1..].to_vec(),
            });
        }
        if let Some(rest) = raw.strip_prefix(b"SC") {
            return parse_chunk(rest);
        }
        Some(Datagram::Plain(raw.to_vec()))
    }

    /// Encodes this record to its wire form. `Plain` payloads are already
    /// in wire form and pass through unchanged.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Datagram::Ack { pid } => format!("TRG:{pid}").into_bytes(),
            Datagram::Single { pid, data } => {
                let mut out = format!("BD:{pid}:").into_bytes();
                out.extend_from_slice(data);
                out
            }
            Datagram::Chunk {
                seq,
                total,
                pid,
                sid,
                data,
            } => {
                let mut out = format!("SC{seq}/{total}:{pid}|{sid}:").into_bytes();
                out.extend_from_slice(data);
                out
            }
            Datagram::Plain(data) => data.clone(),
        }
    }
}

fn parse_chunk(rest: &[u8]) -> Option<Datagram> {
    let slash = rest.iter().position(|&b| b == b'/')?;
    let colon = rest.iter().position(|&b| b == b':')?;
    if colon < slash {
        return None;
    }
    let seq = ascii_u64(&rest[..slash])? as u32;
    let total = ascii_u64(&rest[slash + 1..colon])? as u32;
    let tail = &rest[colon + 1..];
    let pipe = tail.iter().position(|&b| b == b'|')?;
    let colon2 = tail.iter().position(|&b| b == b':')?;
    if colon2 < pipe {
        return None;
    }
    let pid = ascii_u64(&tail[..pipe])?;
    let sid = ascii_u64(&tail[pipe + 1..colon2])?;
    if total == 0 || seq == 0 || seq > total {
        return None;
    }
    Some(Datagram::Chunk {
        seq,
        total,
        pid,
        sid,
        data: tail[colon2 + 1..].to_vec(),
    })
}

/// Parses the `<id+1>:` prefix carried by every inbound datagram and
/// returns the session id plus the remaining body.
pub fn strip_session_prefix(raw: &[u8]) -> Option<(PlayerId, &[u8])> {
    let sep = raw.iter().position(|&b| b == b':')?;
    if sep == 0 || sep > 3 {
        return None;
    }
    let shifted = ascii_u64(&raw[..sep])?;
    let id = u8::try_from(shifted.checked_sub(1)?).ok()?;
    Some((PlayerId(id), &raw[sep + 1..]))
}

/// Builds the `<id+1>:` prefix for the first datagram leg.
pub fn session_prefix(id: PlayerId) -> String {
    format!("{}:", id.0 as u16 + 1)
}

fn ascii_u64(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Strict decimal parse used wherever the grammar carries a small id;
/// any non-digit byte is a protocol violation.
pub fn parse_id(field: &str) -> Option<u8> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    field.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_roundtrip() {
        let d = Datagram::parse(b"TRG:4217").unwrap();
        assert_eq!(d, Datagram::Ack { pid: 4217 });
        assert_eq!(d.encode(), b"TRG:4217");
    }

    #[test]
    fn single_keeps_colons_in_body() {
        let d = Datagram::parse(b"BD:7:C:Alice:hi there").unwrap();
        assert_eq!(
            d,
            Datagram::Single {
                pid: 7,
                data: b"C:Alice:hi there".to_vec()
            }
        );
    }

    #[test]
    fn chunk_roundtrip() {
        let raw = b"SC2/3:15|4:payload|with:junk";
        let d = Datagram::parse(raw).unwrap();
        match &d {
            Datagram::Chunk {
                seq,
                total,
                pid,
                sid,
                data,
            } => {
                assert_eq!((*seq, *total, *pid, *sid), (2, 3, 15, 4));
                assert_eq!(data, b"payload|with:junk");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(d.encode(), raw);
    }

    #[test]
    fn malformed_reliable_records_rejected() {
        assert!(Datagram::parse(b"TRG:12a").is_none());
        assert!(Datagram::parse(b"BD:x:data").is_none());
        assert!(Datagram::parse(b"SC0/3:1|2:x").is_none());
        assert!(Datagram::parse(b"SC4/3:1|2:x").is_none());
    }

    #[test]
    fn unknown_prefix_is_plain() {
        let d = Datagram::parse(b"Zs:whatever").unwrap();
        assert_eq!(d, Datagram::Plain(b"Zs:whatever".to_vec()));
    }

    #[test]
    fn session_prefix_roundtrip() {
        let p = session_prefix(PlayerId(0));
        assert_eq!(p, "1:");
        let (id, rest) = strip_session_prefix(b"1:p").unwrap();
        assert_eq!(id, PlayerId(0));
        assert_eq!(rest, b"p");

        let (id, _) = strip_session_prefix(b"255:x").unwrap();
        assert_eq!(id, PlayerId(254));
        assert!(strip_session_prefix(b":x").is_none());
        assert!(strip_session_prefix(b"0:x").is_none());
        assert!(strip_session_prefix(b"abc").is_none());
    }

    #[test]
    fn channel_policy() {
        assert!(forced_reliable(b'E'));
        assert!(!forced_reliable(b'X'));
        assert!(wants_large(b'O', 10));
        assert!(wants_large(b'T', 10));
        assert!(wants_large(b'J', CHUNK_LEN + 1));
        assert!(!wants_large(b'J', CHUNK_LEN));
        assert!(is_world_data(b'V') && is_world_data(b'Z'));
        assert!(!is_world_data(b'U'));
    }

    #[test]
    fn id_fields_reject_non_digits() {
        assert_eq!(parse_id("12"), Some(12));
        assert_eq!(parse_id("1x"), None);
        assert_eq!(parse_id(""), None);
        assert_eq!(parse_id("-1"), None);
    }
}
