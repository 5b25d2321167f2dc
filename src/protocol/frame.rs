//! Line-oriented `<item>` framing.
//!
//! The [`Framer`] consumes one physical line at a time and yields a
//! [`RawItem`] whenever a frame completes. It keeps the partially read frame
//! between calls, so a frame may be laid out in any of these shapes:
//!
//! ```text
//! <item><type>..</type><code>..</code><length>5</length><data encoding="base64">SGVsbG8=</data></item>
//!
//! <item><type>..</type><code>..</code><length>5</length>
//! <data encoding="base64">
//! SGVs
//! bG8=
//! </data></item>
//!
//! <item><type>..</type><code>..</code><length>0</length>
//! </item>
//! ```
//!
//! Any framing error discards the frame in progress and resets the framer, so
//! that the next `<item>` starts from a clean slate.

use std::{mem, sync::LazyLock};

use base64::prelude::*;
use regex_lite::Regex;
use thiserror::Error;

use super::codes::FourCc;

const ITEM_START: &str = "<item>";
const ITEM_END: &str = "</item>";
const DATA_START: &str = "<data encoding=\"base64\">";
const DATA_END: &str = "</data></item>";

/// A header spread over several lines should not take more than this.
const MAX_HEADER_LEN: usize = 512;

static TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<type>([0-9a-fA-F]{8})</type>").expect("valid regex"));
static CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<code>([0-9a-fA-F]{8})</code>").expect("valid regex"));
static LENGTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<length>(\d+)</length>").expect("valid regex"));
static DATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<data encoding="base64">([^<]+)</data>"#).expect("valid regex")
});

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed item header: {0}")]
    MalformedHeader(String),
    #[error("invalid {field} in item header: {value}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("item payload exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Header {
    kind: u32,
    code: u32,
    length: usize,
}

/// A complete frame with its payload still base64-encoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawItem {
    pub kind: u32,
    pub code: u32,
    pub length: usize,
    pub data: String,
}

impl RawItem {
    /// Decodes the base64 payload.
    ///
    /// Items that declare a zero length, or that have no data section, have
    /// an empty payload.
    pub fn decode(self) -> Result<Item, FrameError> {
        let payload = if self.length > 0 && !self.data.is_empty() {
            BASE64_STANDARD.decode(self.data.as_bytes())?
        } else {
            Vec::new()
        };

        if payload.len() != self.length {
            trace!(
                "item {} declares {} bytes but carries {}",
                FourCc(self.code),
                self.length,
                payload.len()
            );
        }

        Ok(Item {
            kind: self.kind,
            code: self.code,
            payload,
        })
    }
}

/// A decoded frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Item {
    pub kind: u32,
    pub code: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Framer {
    current: Option<Header>,
    pending_header: Option<String>,
    collecting: bool,
    buffer: String,
    max_payload: usize,
}

impl Framer {
    /// Creates a framer that rejects payloads with more than `max_payload`
    /// bytes of base64 text.
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            current: None,
            pending_header: None,
            collecting: false,
            buffer: String::new(),
            max_payload,
        }
    }

    /// Whether a frame has been started but not completed.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.current.is_some() || self.pending_header.is_some()
    }

    /// Advances the framer by one line, returning the frame it completes.
    ///
    /// Surrounding whitespace, including the line terminator, is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed headers and oversized payloads. The
    /// frame in progress is discarded in that case.
    pub fn push_line(&mut self, line: &str) -> Result<Option<RawItem>, FrameError> {
        let result = self.advance(line.trim());
        if result.is_err() {
            self.reset();
        }
        result
    }

    /// Discards the frame in progress.
    pub fn reset(&mut self) {
        self.current = None;
        self.pending_header = None;
        self.collecting = false;
        self.buffer.clear();
    }

    fn advance(&mut self, line: &str) -> Result<Option<RawItem>, FrameError> {
        if line.is_empty() {
            return Ok(None);
        }

        if line.starts_with(ITEM_START) {
            if self.in_progress() {
                debug!("discarding incomplete item");
                self.reset();
            }
            return self.start_item(line);
        }

        if let Some(mut header) = self.pending_header.take() {
            header.push_str(line);
            return self.start_item(&header);
        }

        if self.collecting {
            if line.starts_with(DATA_END) {
                return Ok(self.complete());
            }

            if let Some(data) = line.strip_suffix(DATA_END) {
                self.append(data)?;
                return Ok(self.complete());
            }

            self.append(line)?;
            return Ok(None);
        }

        if self.current.is_some() {
            if line == ITEM_END {
                return Ok(self.complete());
            }

            if line.starts_with(DATA_START) {
                return self.start_data(line);
            }
        }

        debug!("unhandled line: {line}");
        Ok(None)
    }

    fn start_item(&mut self, line: &str) -> Result<Option<RawItem>, FrameError> {
        let Some(header) = parse_header(line)? else {
            // The header may continue on the next line, as long as nothing
            // that follows a header has been seen yet.
            if line.contains(ITEM_END) || line.contains(DATA_START) || line.len() > MAX_HEADER_LEN
            {
                return Err(FrameError::MalformedHeader(line.to_owned()));
            }

            self.pending_header = Some(line.to_owned());
            return Ok(None);
        };

        trace!(
            "item type {} code {} length {}",
            FourCc(header.kind),
            FourCc(header.code),
            header.length
        );

        self.current = Some(header);
        self.collecting = false;
        self.buffer.clear();

        if line.contains(ITEM_END) {
            if let Some(captures) = DATA_RE.captures(line) {
                self.append(&captures[1])?;
            }
            return Ok(self.complete());
        }

        if line.contains(DATA_START) {
            return self.start_data(line);
        }

        Ok(None)
    }

    fn start_data(&mut self, line: &str) -> Result<Option<RawItem>, FrameError> {
        self.collecting = true;

        let Some(start) = line.find(DATA_START) else {
            return Ok(None);
        };

        let data = &line[start + DATA_START.len()..];
        if let Some(end) = data.find(DATA_END) {
            self.append(&data[..end])?;
            return Ok(self.complete());
        }

        self.append(data)?;
        Ok(None)
    }

    fn append(&mut self, data: &str) -> Result<(), FrameError> {
        if self.buffer.len() + data.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge(self.max_payload));
        }

        self.buffer.push_str(data);
        Ok(())
    }

    fn complete(&mut self) -> Option<RawItem> {
        self.collecting = false;
        let data = mem::take(&mut self.buffer);
        let header = self.current.take()?;

        Some(RawItem {
            kind: header.kind,
            code: header.code,
            length: header.length,
            data,
        })
    }
}

/// Same limit as [`Config::default`](crate::config::Config).
impl Default for Framer {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

/// Parses the `type`, `code` and `length` tags of a header.
///
/// Returns `Ok(None)` when one of the tags is absent.
fn parse_header(line: &str) -> Result<Option<Header>, FrameError> {
    let (Some(kind), Some(code), Some(length)) = (
        TYPE_RE.captures(line),
        CODE_RE.captures(line),
        LENGTH_RE.captures(line),
    ) else {
        return Ok(None);
    };

    let invalid = |field: &'static str, value: &str| FrameError::InvalidNumber {
        field,
        value: value.to_owned(),
    };

    let kind = u32::from_str_radix(&kind[1], 16).map_err(|_| invalid("type", &kind[1]))?;
    let code = u32::from_str_radix(&code[1], 16).map_err(|_| invalid("code", &code[1]))?;
    let length = length[1]
        .parse::<usize>()
        .map_err(|_| invalid("length", &length[1]))?;

    Ok(Some(Header { kind, code, length }))
}
