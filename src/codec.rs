//! Wire codec for the reader's line protocol and Mifare block0 decoding.
//!
//! Frames are newline-terminated text: a verb, a space, and an optional
//! argument (`CARD 0102030404...`, `AUTH 1`, `PING`).
//!
//! Key design goals:
//! - **Closed verb set**: known verbs are enum variants, anything else is kept
//!   as `Verb::Other` so newer firmware commands pass through harmlessly
//! - **Never crash on card data**: malformed hex, short blocks and bad BCC
//!   bytes all collapse to "no UID"
//! - **Pure**: nothing here touches the link or shared state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::CardDataError;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

/// Cascade tag marking a UID that continues in the next segment.
pub const CASCADE_TAG: u8 = 0x88;

/// `NTFY` code sent while the relaxed (fallback code) mode is in effect.
pub const NTFY_BREAK: u8 = 3;

/// `NTFY` code sent while full UID authorization is required.
pub const NTFY_NORMAL: u8 = 4;

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Protocol verbs, inbound and outbound.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Card presented (in).
    Card,
    /// Heartbeat reply carrying door status (in).
    Pong,
    /// Shutdown request (in).
    Exit,
    /// Authorization result (out).
    Auth,
    /// Break / override notification (out).
    Ntfy,
    /// Explicit door open/close (out).
    Door,
    /// Heartbeat request (out).
    Ping,
    /// Anything the gateway does not know yet.
    Other(String),
}

impl Verb {
    pub fn as_str(&self) -> &str {
        match self {
            Verb::Card => "CARD",
            Verb::Pong => "PONG",
            Verb::Exit => "EXIT",
            Verb::Auth => "AUTH",
            Verb::Ntfy => "NTFY",
            Verb::Door => "DOOR",
            Verb::Ping => "PING",
            Verb::Other(verb) => verb,
        }
    }

    /// Case-normalizing parse; never fails.
    pub fn parse(token: &str) -> Self {
        let upper = token.to_ascii_uppercase();
        match upper.as_str() {
            "CARD" => Verb::Card,
            "PONG" => Verb::Pong,
            "EXIT" => Verb::Exit,
            "AUTH" => Verb::Auth,
            "NTFY" => Verb::Ntfy,
            "DOOR" => Verb::Door,
            "PING" => Verb::Ping,
            _ => Verb::Other(upper),
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub verb: Verb,
    pub argument: Option<String>,
}

impl Frame {
    pub fn new(verb: Verb, argument: Option<&str>) -> Self {
        Self {
            verb,
            argument: argument.map(str::to_string),
        }
    }
}

/// Text encoding used on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8", alias = "UTF-8")]
    Utf8,
    #[serde(rename = "ascii", alias = "us-ascii", alias = "ASCII")]
    Ascii,
}

impl TextEncoding {
    /// Encode `text`; non-ASCII characters become `?` under ASCII.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    /// Decode a received line, dropping undecodable bytes.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes)
                .chars()
                .filter(|c| *c != char::REPLACEMENT_CHARACTER)
                .collect(),
            TextEncoding::Ascii => bytes
                .iter()
                .filter(|b| b.is_ascii())
                .map(|b| *b as char)
                .collect(),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            other => Err(format!("unsupported encoding {other:?}")),
        }
    }
}

/// Split a received line into verb and argument.
///
/// Returns `None` for blank lines. The argument is everything after the first
/// run of whitespace, trimmed.
pub fn decode_frame(line: &str) -> Option<Frame> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (verb, rest) = match trimmed.find(char::is_whitespace) {
        Some(pos) => (&trimmed[..pos], trimmed[pos..].trim()),
        None => (trimmed, ""),
    };
    Some(Frame {
        verb: Verb::parse(verb),
        argument: (!rest.is_empty()).then(|| rest.to_string()),
    })
}

/// Render `"{VERB} {ARGUMENT}\n"` (or `"{VERB}\n"`) in `encoding`.
pub fn encode_frame(verb: &Verb, argument: Option<&str>, encoding: TextEncoding) -> Vec<u8> {
    debug_assert!(
        !verb.as_str().is_empty() && !verb.as_str().contains(char::is_whitespace),
        "verb must be a single non-empty token"
    );
    debug_assert!(
        argument.map_or(true, |a| !a.contains('\n')),
        "argument must fit on one line"
    );
    let line = match argument {
        Some(arg) => format!("{verb} {arg}\n"),
        None => format!("{verb}\n"),
    };
    encoding.encode(&line)
}

/// Render an operator-supplied command line as-is, newline terminated.
pub fn encode_raw_line(text: &str, encoding: TextEncoding) -> Vec<u8> {
    let mut line = text.trim_end_matches(['\r', '\n']).to_string();
    line.push('\n');
    encoding.encode(&line)
}

// ---------------------------------------------------------------------------
// Block0 / UID extraction
// ---------------------------------------------------------------------------

/// First data block of a Mifare card, as it arrives.
#[derive(Debug, Clone, Copy)]
pub enum Block0<'a> {
    Hex(&'a str),
    Bytes(&'a [u8]),
}

/// Byte positions of cascade tags and BCCs for a given UID length.
struct UidLayout {
    cascade_tags: &'static [usize],
    bcc: &'static [usize],
}

impl UidLayout {
    fn for_length(uid_len: usize) -> Self {
        match uid_len {
            10 => Self {
                cascade_tags: &[0, 5],
                bcc: &[4, 9, 14],
            },
            7 => Self {
                cascade_tags: &[0],
                bcc: &[4, 9],
            },
            _ => Self {
                cascade_tags: &[],
                bcc: &[4],
            },
        }
    }

    /// Bytes of block0 covered by the UID segments.
    fn span(&self) -> usize {
        self.bcc.last().map_or(5, |last| last + 1)
    }
}

/// Structural UID length: 4, 7 or 10 bytes depending on cascade tags.
pub fn uid_length(bytes: &[u8]) -> usize {
    match (bytes.first(), bytes.get(5)) {
        (Some(&CASCADE_TAG), Some(&CASCADE_TAG)) => 10,
        (Some(&CASCADE_TAG), _) => 7,
        _ => 4,
    }
}

/// Block check character: XOR of the four bytes preceding `position`.
pub fn bcc(bytes: &[u8], position: usize) -> u8 {
    bytes[position - 4..position].iter().fold(0, |acc, b| acc ^ b)
}

/// Hex text → bytes. Odd-length input gets a `0` inserted in front of the
/// trailing manufacturer-code pair, which must stay two digits.
pub fn block0_bytes(block0: Block0<'_>) -> Result<Vec<u8>, CardDataError> {
    let hex = match block0 {
        Block0::Bytes(bytes) => return Ok(bytes.to_vec()),
        Block0::Hex(hex) => hex.trim(),
    };
    if !hex.is_ascii() {
        return Err(CardDataError::InvalidHex(hex.to_string()));
    }
    let padded = if hex.len() % 2 == 0 {
        hex.to_string()
    } else {
        debug!(block0 = hex, "Padding odd-length block0 before manufacturer code");
        let split = hex.len().saturating_sub(2);
        format!("{}0{}", &hex[..split], &hex[split..])
    };
    decode_hex(&padded)
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, CardDataError> {
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| CardDataError::InvalidHex(hex.to_string()))
        })
        .collect()
}

/// Validate every BCC and return the UID as lowercase hex.
pub fn parse_uid(block0: Block0<'_>) -> Result<String, CardDataError> {
    let bytes = block0_bytes(block0)?;
    let uid_len = uid_length(&bytes);
    let layout = UidLayout::for_length(uid_len);

    if bytes.len() < layout.span() {
        return Err(CardDataError::TooShort {
            len: bytes.len(),
            needed: layout.span(),
        });
    }

    for &position in layout.bcc {
        let expected = bcc(&bytes, position);
        if bytes[position] != expected {
            return Err(CardDataError::ChecksumMismatch {
                position,
                expected,
                found: bytes[position],
            });
        }
    }

    let uid: String = bytes[..layout.span()]
        .iter()
        .enumerate()
        .filter(|(i, _)| !layout.cascade_tags.contains(i) && !layout.bcc.contains(i))
        .map(|(_, b)| format!("{b:02x}"))
        .take(uid_len)
        .collect();
    Ok(uid)
}

/// UID of a presented card, or `None` when block0 is unusable.
pub fn extract_uid(block0: Block0<'_>) -> Option<String> {
    match parse_uid(block0) {
        Ok(uid) => Some(uid),
        Err(e @ CardDataError::ChecksumMismatch { .. }) => {
            warn!(error = %e, block0 = ?block0, "Invalid BCC in card UID");
            None
        }
        Err(e) => {
            debug!(error = %e, block0 = ?block0, "Unusable block0");
            None
        }
    }
}

/// Last two hex characters of a raw block0 string (the manufacturer code).
pub fn manufacturer_code(block0: &str) -> &str {
    let trimmed = block0.trim();
    let start = trimmed.len().saturating_sub(2);
    trimmed.get(start..).unwrap_or("")
}

// ===========================================================================
// Tests
// ===========================================================================
