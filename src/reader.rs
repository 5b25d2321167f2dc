//! Metadata stream reader.
//!
//! The [`Reader`] turns lines of the shairport-sync metadata stream into
//! metadata bundles and playback state requests, handed to a [`Handler`].
//! It never fails on malformed input: framing and decoding problems are
//! logged and the offending item or field is skipped.
//!
//! # Example
//!
//! ```rust
//! use nowplaying::{bundle::Bundle, config::Config, reader::{Handler, Reader}, state::PlaybackState};
//!
//! struct Print;
//!
//! impl Handler for Print {
//!     fn on_metadata(&mut self, bundle: Bundle) {
//!         println!("{bundle}");
//!     }
//!
//!     fn on_state_request(&mut self, state: PlaybackState) {
//!         println!("{state}");
//!     }
//! }
//!
//! let mut reader = Reader::new(&Config::default(), Print);
//! reader.process_line("<item><type>73736e63</type><code>70626567</code><length>0</length></item>");
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    artwork::ArtworkStore,
    bundle::{Bundle, MetadataId, COVER_ART_PATH},
    config::Config,
    error::ErrorKind,
    protocol::{
        codes::{self, TYPE_CORE, TYPE_SSNC},
        FourCc, FrameError, Framer, SsncCode,
    },
    state::PlaybackState,
};

/// Receives what the reader extracts from the stream.
pub trait Handler {
    /// Called for every dispatched bundle.
    fn on_metadata(&mut self, bundle: Bundle);

    /// Called when the stream signals a playback state. Whether the state
    /// actually changes is up to the handler.
    fn on_state_request(&mut self, state: PlaybackState);
}

/// Why a payload was not used as text.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("<binary data, {0} bytes>")]
    Binary(usize),
}

/// Decodes a payload as trimmed text.
///
/// A payload that decodes as UTF-8 but contains control characters other
/// than tab, carriage return and line feed is considered binary. This
/// includes DEL and the C1 controls. Several
/// numeric fields share codes with text fields across protocol versions.
pub fn decode_text(payload: &[u8]) -> Result<&str, PayloadError> {
    let text = std::str::from_utf8(payload)?.trim();

    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\r' | '\n'))
    {
        return Err(PayloadError::Binary(payload.len()));
    }

    Ok(text)
}

/// Decodes an ASCII payload of a control item, such as a timestamp or an
/// address.
fn decode_ascii(payload: &[u8]) -> Option<&str> {
    if payload.is_ascii() {
        std::str::from_utf8(payload).ok().map(str::trim)
    } else {
        None
    }
}

/// Every dispatched bundle carries a sequence number that no earlier
/// dispatch used. Cover art arriving inside an open bundle dispatches it
/// early; the bundle end that follows then dispatches again under the next
/// number.
pub struct Reader<H> {
    handler: H,
    framer: Framer,
    artwork: ArtworkStore,

    fields: BTreeMap<String, String>,
    bundle_id: Option<MetadataId>,
    bundle_active: bool,

    /// Grows with every dispatched bundle, for the lifetime of the reader.
    sequence: u64,
    /// Sequence number of the last dispatch.
    dispatched: Option<u64>,
}

impl<H: Handler> Reader<H> {
    #[must_use]
    pub fn new(config: &Config, handler: H) -> Self {
        Self::with_parts(
            Framer::new(config.max_payload_size),
            ArtworkStore::from_config(config),
            handler,
        )
    }

    #[must_use]
    pub fn with_parts(framer: Framer, artwork: ArtworkStore, handler: H) -> Self {
        Self {
            handler,
            framer,
            artwork,
            fields: BTreeMap::new(),
            bundle_id: None,
            bundle_active: false,
            sequence: 0,
            dispatched: None,
        }
    }

    /// Consumes one line of the stream.
    ///
    /// Trailing whitespace, including the line terminator, is ignored.
    pub fn process_line(&mut self, line: &str) {
        trace!("line: {}", line.trim_end());

        let raw = match self.framer.push_line(line) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!("discarding item: {e}");
                return;
            }
        };

        let code = FourCc(raw.code);
        let item = match raw.decode() {
            Ok(item) => item,
            Err(e @ FrameError::InvalidBase64(_)) => {
                debug!("discarding item {code}: {e}");
                return;
            }
            Err(e) => {
                warn!("discarding item {code}: {e}");
                return;
            }
        };

        match item.kind {
            TYPE_CORE => self.handle_core(item.code, &item.payload),
            TYPE_SSNC => self.handle_ssnc(item.code, &item.payload),
            kind => debug!("unknown item type {} with code {code}", FourCc(kind)),
        }
    }

    /// Forgets the current bundle and its fields.
    pub fn clear_fields(&mut self) {
        self.fields.clear();
        self.bundle_id = None;
        self.bundle_active = false;
    }

    /// Fields collected for the current bundle so far.
    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn handle_core(&mut self, code: u32, payload: &[u8]) {
        let Some(field) = codes::core_field(code) else {
            log_unknown_core(code, payload);
            return;
        };

        match decode_text(payload) {
            Ok(value) => {
                debug!("{field}: {value}");
                self.fields.insert(field.to_owned(), value.to_owned());
            }
            Err(e) => debug!("{field}: {e}"),
        }
    }

    fn handle_ssnc(&mut self, code: u32, payload: &[u8]) {
        let Some(ssnc) = SsncCode::from_code(code) else {
            debug!("unknown ssnc code {}", FourCc(code));
            return;
        };

        match ssnc {
            SsncCode::PlayControlState => match decode_ascii(payload) {
                Some("1") => self.handler.on_state_request(PlaybackState::Playing),
                Some("0") => self.handler.on_state_request(PlaybackState::Paused),
                Some(other) => debug!("unknown play control state: {other}"),
                None => warn!("failed to decode play control state"),
            },

            SsncCode::MetadataStart => self.start_bundle(payload),
            SsncCode::MetadataEnd => self.end_bundle(payload),

            SsncCode::PlayBegin => {
                debug!("play session begins");
                self.handler.on_state_request(PlaybackState::Playing);
            }
            SsncCode::PlayResume => {
                debug!("play stream resumes");
                self.handler.on_state_request(PlaybackState::Playing);
            }
            SsncCode::PlayEnd => {
                debug!("play session ends");
                self.handler.on_state_request(PlaybackState::Stopped);
            }
            SsncCode::ActiveEnd => {
                debug!("receiver exits active state");
                self.handler.on_state_request(PlaybackState::NoSession);
            }

            SsncCode::Picture => self.handle_picture(payload),

            informational => match decode_ascii(payload) {
                Some(value) if !value.is_empty() => debug!("{informational:?}: {value}"),
                Some(_) => debug!("{informational:?}"),
                None => debug!("{informational:?}: <{} bytes>", payload.len()),
            },
        }
    }

    fn start_bundle(&mut self, payload: &[u8]) {
        self.fields.clear();
        self.bundle_active = true;
        self.bundle_id = Some(MetadataId::fast_v4());
        self.sequence += 1;
        debug!("bundle #{} starts", self.sequence);

        if let Some(rtp) = decode_ascii(payload).filter(|rtp| !rtp.is_empty()) {
            debug!("bundle rtp timestamp: {rtp}");
            self.fields.insert("rtp_timestamp".to_owned(), rtp.to_owned());
        }
    }

    fn end_bundle(&mut self, payload: &[u8]) {
        if let Some(rtp) = decode_ascii(payload).filter(|rtp| !rtp.is_empty()) {
            debug!("bundle ends at rtp timestamp {rtp}");
        }

        // Fields are kept, so that cover art arriving after the end of the
        // bundle can still be attached to it.
        if self.bundle_active && !self.fields.is_empty() {
            if self.dispatched == Some(self.sequence) {
                self.sequence += 1;
            }
            self.dispatch();
        }
        self.bundle_active = false;
    }

    fn handle_picture(&mut self, payload: &[u8]) {
        if payload.is_empty() {
            debug!("empty cover art");
            return;
        }

        debug!("cover art of {} bytes", payload.len());

        let album = self.fields.get("album").map(String::as_str);
        let saved = match self.artwork.save(album, payload) {
            Ok(saved) => saved,
            Err(e) if e.kind == ErrorKind::ResourceExhausted => {
                warn!("not saving cover art: {e}");
                return;
            }
            Err(e) => {
                error!("failed to save cover art: {e}");
                return;
            }
        };

        let path = saved.path.to_string_lossy().into_owned();
        if saved.written {
            info!("cover art saved to {path}");
        } else {
            debug!("cover art already exists: {path}");
        }

        if self.bundle_id.is_none() {
            debug!("no bundle to attach cover art to");
            return;
        }

        self.sequence += 1;
        self.fields.insert(COVER_ART_PATH.to_owned(), path);
        self.dispatch();
    }

    fn dispatch(&mut self) {
        let Some(id) = self.bundle_id else {
            return;
        };

        self.dispatched = Some(self.sequence);
        let bundle = Bundle::new(id, self.sequence, self.fields.clone());
        info!("dispatching metadata {bundle}");
        self.handler.on_metadata(bundle);
    }
}

fn log_unknown_core(code: u32, payload: &[u8]) {
    let value = match decode_text(payload) {
        Ok(text) => text.to_owned(),
        Err(e) => e.to_string(),
    };

    match codes::dmap_description(code) {
        Some(description) => debug!("{} ({description}): {value}", FourCc(code)),
        None => debug!("unknown core code {}: {value}", FourCc(code)),
    }
}

#[cfg(test)]
mod tests {
    use base64::prelude::*;

    use super::*;
    use crate::artwork::checksum;

    const ALBUM: u32 = 0x6173_616c;
    const ARTIST: u32 = 0x6173_6172;
    const TITLE: u32 = 0x6d69_6e6d;
    const GENRE: u32 = 0x6173_676e;

    const MDST: u32 = 0x6d64_7374;
    const MDEN: u32 = 0x6d64_656e;
    const PBEG: u32 = 0x7062_6567;
    const PEND: u32 = 0x7065_6e64;
    const PCST: u32 = 0x7063_7374;
    const AEND: u32 = 0x6165_6e64;
    const PICT: u32 = 0x5049_4354;
    const PRGR: u32 = 0x7072_6772;

    const JPEG: &[u8] = b"\xff\xd8\xff\xe0\x00\x10JFIF\x00\x01";

    #[derive(Default)]
    struct Recorder {
        bundles: Vec<Bundle>,
        states: Vec<PlaybackState>,
    }

    impl Handler for Recorder {
        fn on_metadata(&mut self, bundle: Bundle) {
            self.bundles.push(bundle);
        }

        fn on_state_request(&mut self, state: PlaybackState) {
            self.states.push(state);
        }
    }

    fn frame(kind: u32, code: u32, payload: &[u8]) -> String {
        let head = format!(
            "<item><type>{kind:08x}</type><code>{code:08x}</code><length>{}</length>",
            payload.len()
        );

        if payload.is_empty() {
            format!("{head}</item>")
        } else {
            format!(
                "{head}<data encoding=\"base64\">{}</data></item>",
                BASE64_STANDARD.encode(payload)
            )
        }
    }

    fn core(code: u32, text: &str) -> String {
        frame(TYPE_CORE, code, text.as_bytes())
    }

    fn ssnc(code: u32, payload: &[u8]) -> String {
        frame(TYPE_SSNC, code, payload)
    }

    fn reader(dir: &std::path::Path) -> Reader<Recorder> {
        Reader::with_parts(
            Framer::default(),
            ArtworkStore::new(dir, "cover_", 1024 * 1024),
            Recorder::default(),
        )
    }

    fn feed(reader: &mut Reader<Recorder>, lines: &[String]) {
        for line in lines {
            reader.process_line(&format!("{line}\n"));
        }
    }

    #[test]
    fn abbey_road_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(MDST, b""),
                core(ALBUM, "Abbey Road"),
                core(ARTIST, "The Beatles"),
                ssnc(MDEN, b""),
            ],
        );

        let recorder = reader.handler();
        assert_eq!(recorder.bundles.len(), 1);

        let map = recorder.bundles[0].to_map();
        assert_eq!(map.len(), 4);
        assert_eq!(map["artist"], "The Beatles");
        assert_eq!(map["album"], "Abbey Road");
        assert_eq!(map["sequence_number"], "1");
        assert!(!map["metadata_id"].is_empty());
        assert!(recorder.states.is_empty());

        reader.process_line(&ssnc(PBEG, b""));
        assert_eq!(reader.handler().states, [PlaybackState::Playing]);
        assert_eq!(reader.handler().bundles.len(), 1);
    }

    #[test]
    fn bundles_are_sequenced() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());
        let cycle = [
            ssnc(MDST, b""),
            core(ARTIST, "The Beatles"),
            core(TITLE, "Something"),
            core(GENRE, "Rock"),
            ssnc(MDEN, b""),
        ];

        feed(&mut reader, &cycle);
        feed(&mut reader, &cycle);

        let bundles = &reader.handler().bundles;
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].fields.len(), 3);
        assert!(bundles[1].sequence > bundles[0].sequence);
        assert_ne!(bundles[0].id, bundles[1].id);
    }

    #[test]
    fn bundle_start_clears_previous_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(MDST, b""),
                core(ALBUM, "Abbey Road"),
                ssnc(MDEN, b""),
                ssnc(MDST, b""),
                core(TITLE, "Help!"),
                ssnc(MDEN, b""),
            ],
        );

        let second = &reader.handler().bundles[1];
        assert_eq!(second.get("album"), None);
        assert_eq!(second.get("title"), Some("Help!"));
    }

    #[test]
    fn bundle_start_records_rtp_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(&mut reader, &[ssnc(MDST, b"1234567890"), ssnc(MDEN, b"1234567890")]);
        assert_eq!(reader.handler().bundles[0].get("rtp_timestamp"), Some("1234567890"));
    }

    #[test]
    fn empty_or_inactive_bundles_are_not_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(&mut reader, &[ssnc(MDST, b""), ssnc(MDEN, b"")]);
        assert!(reader.handler().bundles.is_empty());

        // Fields without a bundle start are collected but never dispatched.
        feed(&mut reader, &[core(ALBUM, "Abbey Road"), ssnc(MDEN, b""), ssnc(MDEN, b"")]);
        assert!(reader.handler().bundles.is_empty());
    }

    #[test]
    fn multi_line_payload_yields_same_value() {
        let dir = tempfile::tempdir().unwrap();
        let value = "Golden Slumbers / Carry That Weight / The End";
        let encoded = BASE64_STANDARD.encode(value);
        let head = format!(
            "<item><type>636f7265</type><code>{TITLE:08x}</code><length>{}</length>",
            value.len()
        );
        let (a, rest) = encoded.split_at(10);
        let (b, c) = rest.split_at(20);

        for lines in [
            vec![core(TITLE, value)],
            vec![
                head.clone(),
                "<data encoding=\"base64\">".to_owned(),
                encoded.clone(),
                "</data></item>".to_owned(),
            ],
            vec![
                head.clone(),
                format!("<data encoding=\"base64\">{a}"),
                b.to_owned(),
                format!("{c}</data></item>"),
            ],
        ] {
            let mut reader = reader(dir.path());
            reader.process_line(&ssnc(MDST, b""));
            feed(&mut reader, &lines);
            reader.process_line(&ssnc(MDEN, b""));
            assert_eq!(reader.handler().bundles[0].get("title"), Some(value));
        }
    }

    #[test]
    fn binary_payloads_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(MDST, b""),
                frame(TYPE_CORE, TITLE, b"Some\x00thing"),
                frame(TYPE_CORE, GENRE, b"\x01\x02\x03\x04"),
                frame(TYPE_CORE, ALBUM, b"\xff\xfe\xfd"),
                core(ARTIST, "The Beatles"),
                ssnc(MDEN, b""),
            ],
        );

        let bundle = &reader.handler().bundles[0];
        assert_eq!(bundle.get("title"), None);
        assert_eq!(bundle.get("genre"), None);
        assert_eq!(bundle.get("album"), None);
        assert_eq!(bundle.get("artist"), Some("The Beatles"));
    }

    #[test]
    fn text_keeps_tabs_and_newlines() {
        assert_eq!(decode_text(b"  line one\nline\ttwo \r\n").unwrap(), "line one\nline\ttwo");
        assert!(matches!(decode_text(b"a\x1bb"), Err(PayloadError::Binary(3))));
        assert!(matches!(decode_text(b"a\x7fb"), Err(PayloadError::Binary(3))));
        assert!(matches!(decode_text("a\u{85}b".as_bytes()), Err(PayloadError::Binary(4))));
        assert_eq!(decode_text("Sigur Rós".as_bytes()).unwrap(), "Sigur Rós");
        assert!(matches!(decode_text(b"\xc3\x28"), Err(PayloadError::Utf8(_))));
    }

    #[test]
    fn unknown_codes_store_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(MDST, b""),
                core(0x6d70_6572, "12345678"),
                core(0x1234_5678, "whatever"),
                frame(0x7a7a_7a7a, ALBUM, b"Abbey Road"),
                core(ALBUM, "Abbey Road"),
                ssnc(MDEN, b""),
            ],
        );

        let bundle = &reader.handler().bundles[0];
        assert_eq!(bundle.fields.len(), 1);
        assert_eq!(bundle.get("album"), Some("Abbey Road"));
    }

    #[test]
    fn control_codes_request_states() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(PBEG, b""),
                ssnc(PCST, b"0"),
                ssnc(PCST, b"1"),
                ssnc(PCST, b"2"),
                ssnc(PEND, b""),
                ssnc(0x7072_736d, b""),
                ssnc(AEND, b""),
            ],
        );

        use PlaybackState::*;
        assert_eq!(
            reader.handler().states,
            [Playing, Paused, Playing, Stopped, Playing, NoSession]
        );
    }

    #[test]
    fn informational_codes_change_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(MDST, b""),
                core(ALBUM, "Abbey Road"),
                ssnc(PRGR, b"1000/2000/3000"),
                ssnc(0x6163_7265, b"1234567890"),
                ssnc(0x636c_6970, b"192.168.1.10"),
                ssnc(0x7376_6970, b"192.168.1.2"),
                ssnc(0x6461_6964, b"ABCDEF0123456789"),
                ssnc(0x7066_6c73, b""),
                ssnc(0x6162_6567, b""),
                ssnc(0x6162_6364, b"unknown"),
                ssnc(MDEN, b""),
            ],
        );

        let recorder = reader.handler();
        assert!(recorder.states.is_empty());
        assert_eq!(recorder.bundles.len(), 1);
        assert_eq!(recorder.bundles[0].fields.len(), 1);
    }

    #[test]
    fn cover_art_is_saved_once_and_dispatched_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(MDST, b""),
                core(ALBUM, "Abbey Road"),
                ssnc(MDEN, b""),
                ssnc(PICT, JPEG),
                ssnc(PICT, JPEG),
            ],
        );

        let bundles = &reader.handler().bundles;
        assert_eq!(bundles.len(), 3);
        assert!(bundles[2].sequence > bundles[1].sequence);
        assert!(bundles[1].sequence > bundles[0].sequence);
        assert_eq!(bundles[1].id, bundles[0].id);

        let expected = dir
            .path()
            .join(format!("cover_Abbey_Road_{}.jpg", checksum(JPEG)));
        assert_eq!(bundles[1].cover_art_path(), expected.to_str());
        assert_eq!(bundles[2].cover_art_path(), expected.to_str());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn bundle_end_after_cover_art_gets_next_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                ssnc(MDST, b""),
                core(ALBUM, "Abbey Road"),
                ssnc(PICT, JPEG),
                core(TITLE, "Come Together"),
                ssnc(MDEN, b""),
            ],
        );

        let bundles = &reader.handler().bundles;
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].get("title"), None);
        assert!(bundles[0].cover_art_path().is_some());
        assert_eq!(bundles[1].get("title"), Some("Come Together"));
        assert!(bundles[1].sequence > bundles[0].sequence);
        assert_eq!(bundles[1].id, bundles[0].id);
    }

    #[test]
    fn cover_art_without_bundle_is_only_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        reader.process_line(&ssnc(PICT, JPEG));
        reader.process_line(&ssnc(PICT, b""));

        assert!(reader.handler().bundles.is_empty());
        let name = format!("cover_unknown_album_{}.jpg", checksum(JPEG));
        assert!(dir.path().join(name).exists());
    }

    #[test]
    fn failed_cover_art_save_does_not_dispatch() {
        let mut reader = Reader::with_parts(
            Framer::default(),
            ArtworkStore::new("/nonexistent/nowplaying", "cover_", 1024),
            Recorder::default(),
        );

        feed(
            &mut reader,
            &[ssnc(MDST, b""), core(ALBUM, "Abbey Road"), ssnc(MDEN, b""), ssnc(PICT, JPEG)],
        );

        assert_eq!(reader.handler().bundles.len(), 1);
        assert_eq!(reader.fields().get(COVER_ART_PATH), None);
    }

    #[test]
    fn clear_fields_detaches_late_cover_art() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(&mut reader, &[ssnc(MDST, b""), core(ALBUM, "Abbey Road"), ssnc(MDEN, b"")]);
        reader.clear_fields();
        reader.process_line(&ssnc(PICT, JPEG));

        assert_eq!(reader.handler().bundles.len(), 1);
        assert!(reader.fields().is_empty());
    }

    #[test]
    fn malformed_input_is_survived() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = reader(dir.path());

        feed(
            &mut reader,
            &[
                "<invalid>xml</invalid>".to_owned(),
                "<item><type>nothex</type></item>".to_owned(),
                format!(
                    "<item><type>636f7265</type><code>{ALBUM:08x}</code><length>10</length>\
                     <data encoding=\"base64\">invalid_base64!</data></item>"
                ),
                ssnc(MDST, b""),
                core(ALBUM, "Abbey Road"),
                ssnc(MDEN, b""),
            ],
        );

        assert_eq!(reader.handler().bundles.len(), 1);
        assert_eq!(reader.handler().bundles[0].get("album"), Some("Abbey Road"));
    }
}
