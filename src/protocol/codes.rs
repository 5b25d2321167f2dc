//! Frame types and code tables.
//!
//! Codes are four ASCII characters packed big-endian into a `u32`, so `asal`
//! is `0x6173_616c`. The tables below are static: an unknown code is not an
//! error, it simply has no entry.

use std::fmt;

/// iTunes-style DMAP metadata.
pub const TYPE_CORE: u32 = 0x636f_7265;

/// shairport-sync session and control signals.
pub const TYPE_SSNC: u32 = 0x7373_6e63;

/// A four-character code as used for frame types and codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FourCc(pub u32);

impl FourCc {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    #[must_use]
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Renders the code as four ASCII characters, if it is printable ASCII.
    #[must_use]
    pub fn as_ascii(self) -> Option<String> {
        let bytes = self.to_bytes();
        if bytes.iter().all(u8::is_ascii_graphic) {
            Some(bytes.iter().map(|&b| char::from(b)).collect())
        } else {
            None
        }
    }
}

/// Formats as `'asal'` when printable, and as `0x6173616c` otherwise.
impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_ascii() {
            Some(ascii) => write!(f, "'{ascii}'"),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

impl From<u32> for FourCc {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

/// Maps a `core` code to the name of the metadata field it carries.
///
/// Only codes in this table are ever stored in a bundle.
#[must_use]
pub fn core_field(code: u32) -> Option<&'static str> {
    let field = match &code.to_be_bytes() {
        b"asal" => "album",
        b"asar" => "artist",
        b"minm" => "title",
        b"asgn" => "genre",
        b"ascp" => "composer",
        b"ascm" => "comment",
        b"asdt" => "description",
        b"asst" => "sortartist",
        b"assn" => "sorttitle",

        b"mikd" => "kind",
        b"asbr" => "bitrate",
        b"asco" => "compilation",
        b"meia" => "media_kind",
        b"asda" => "date_added",
        b"asdm" => "date_modified",
        b"asdc" => "disc_count",
        b"asdn" => "disc_number",
        b"aseq" => "eq_preset",
        b"asrv" => "relative_volume",
        b"assr" => "sample_rate",
        b"assz" => "size",
        b"assp" => "stop_time",
        b"astm" => "time_modified",
        b"astc" => "track_count",
        b"astn" => "track_number",
        b"asur" => "user_rating",

        // Bundle markers are normally `ssnc`, but some senders tag them `core`.
        b"mdst" => "metadata_start",
        b"mden" => "metadata_end",

        b"aeMk" => "apple_extras_make",
        b"aeMX" => "apple_extras_mix",
        b"aspc" => "podcast",
        b"asri" => "rating_index",
        b"aeCS" => "apple_content_source",
        b"aeRS" => "apple_rating_source",
        b"aeRD" => "apple_rating_date",
        b"aeRP" => "apple_rating_policy",
        b"aeRU" => "apple_rating_url",
        b"askp" => "keep_flag",
        b"asac" => "audio_codec",
        b"askd" => "keep_date",
        b"ases" => "equalizer_setting",
        b"aeCM" => "apple_content_manager",
        b"asrs" => "random_seed",
        b"aslr" => "logic_rule",
        b"asas" => "auto_skip",
        b"aeGs" => "apple_genre_source",
        b"aels" => "apple_language_source",

        b"ajal" => "airplay_audio_latency",
        b"ajcA" => "airplay_connection_audio",
        b"awrk" => "airplay_work",
        b"amvm" => "airplay_volume_master",
        b"amvc" => "airplay_volume_current",
        b"amvn" => "airplay_volume_normal",
        b"ajuw" => "airplay_user_workflow",
        b"ajAV" => "airplay_av_sync",
        b"ajAT" => "airplay_audio_track",
        b"ajAE" => "airplay_audio_encoding",
        b"ajAS" => "airplay_audio_stream",

        _ => return None,
    };

    Some(field)
}

/// Human readable descriptions of DMAP tags that are not stored as fields.
///
/// For debug logging only.
#[must_use]
pub fn dmap_description(code: u32) -> Option<&'static str> {
    let description = match &code.to_be_bytes() {
        b"mper" => "Media Player Persistent ID",
        b"mpco" => "Media Player Container",
        b"mlit" => "Media List Item",
        b"aply" => "Apple Playlist",
        b"apso" => "Apple Playlist Sort Order",
        b"arif" => "Artist Information",
        b"daap" => "Digital Audio Access Protocol",
        b"dmap" => "Digital Media Access Protocol",
        b"mstt" => "Media Server Status",
        b"muty" => "Media Server Update Type",
        b"mtco" => "Media Server Total Count",
        b"mrco" => "Media Server Return Count",
        b"mlcl" => "Media List Container List",
        b"mlog" => "Media Server Login",
        b"mlid" => "Media List ID",
        b"msur" => "Media Server Update Response",
        b"msdc" => "Media Server Database Count",
        b"msix" => "Media Server Index",
        b"msal" => "Media Server Album List",
        b"msar" => "Media Server Artist List",
        b"msbr" => "Media Server Browse",
        b"msqy" => "Media Server Query",
        b"msrs" => "Media Server Resolve",
        b"mstm" => "Media Server Timeout",
        b"msts" => "Media Server Status String",
        b"msup" => "Media Server Update",
        b"mtcl" => "Media Server Container List",
        b"mudl" => "Media Server Database List",
        b"mute" => "Media Server Edit",
        b"mupd" => "Media Server Update",
        b"musr" => "Media Server User",
        b"mccr" => "Media Content Code Response",
        b"mcna" => "Media Content Codes Name",
        b"mcnm" => "Media Content Codes Number",
        b"mcty" => "Media Content Codes Type",
        b"mdcl" => "Media Dictionary",
        b"meds" => "Media Edit Status",
        b"mikd" => "Media Item Kind",
        b"minm" => "Media Item Name",
        b"miid" => "Media Item ID",
        b"mimc" => "Media Item Media Count",
        b"mctc" => "Media Container Total Count",
        b"aeNV" => "Audio Equalizer",
        b"aeMK" => "Audio Equalizer Make",
        b"aeMk" => "Apple Extras Make",
        b"aeMX" => "Apple Extras Mix",
        b"aeCS" => "Apple Extras Content Source",
        b"aeRS" => "Apple Extras Rating Source",
        b"aeRD" => "Apple Extras Rating Date",
        b"aeRP" => "Apple Extras Rating Policy",
        b"aeRU" => "Apple Extras Rating URL",
        b"aeCM" => "Apple Extras Content Manager",
        b"aeGs" => "Apple Extras Genre Source",
        b"aels" => "Apple Extras Language Source",
        b"asdk" => "Song Data Kind",
        b"asbt" => "Song Beats Per Minute",
        b"agrp" => "Album Grouping",
        b"aeSI" => "Apple Extras Store ID",
        b"aeAI" => "Apple Extras Album ID",
        b"aePI" => "Apple Extras Playlist ID",
        b"asct" => "Song Category",
        b"ascn" => "Song Content Rating",
        b"ascr" => "Song Copyright",
        b"aeHV" => "Apple Extras Has Video",
        b"aeSN" => "Apple Extras Store Name",
        b"aeEN" => "Apple Extras Episode Number",
        b"aeES" => "Apple Extras Episode Sort",
        b"aeSU" => "Apple Extras Store URL",
        b"aeGH" => "Apple Extras Gapless Heuristic",
        b"aeGD" => "Apple Extras Gapless Data",
        b"aeGU" => "Apple Extras Gapless Duration",
        b"aeGR" => "Apple Extras Gapless Resy",
        b"aeGE" => "Apple Extras Gapless Encoding",
        b"asaa" => "Song Album Artist",
        b"asgp" => "Song Gapless",
        b"mext" => "Media File Extension",
        b"ased" => "Song Episode ID",
        b"asdr" => "Song Date Released",
        b"ashp" => "Song Has Been Played",
        b"assa" => "Song Sort Album",
        b"assl" => "Song Sort Album Artist",
        b"assu" => "Song Sort User",
        b"assc" => "Song Sort Composer",
        b"asss" => "Song Sort Show",
        b"asbk" => "Song Bookmark",
        b"aeCR" => "Apple Extras Content Rating",
        b"asai" => "Song Album ID",
        b"asls" => "Song Last Skip",
        b"aeHD" => "Apple Extras HD",
        b"meip" => "Media Edit Commands",
        b"aspl" => "Song Play Count",
        b"aeSE" => "Apple Extras Season",
        b"aeDV" => "Apple Extras Digital Video",
        b"aeDP" => "Apple Extras Digital Purchase",
        b"aeDR" => "Apple Extras Digital Rental",
        b"aeND" => "Apple Extras Network Name",
        b"aeK1" => "Apple Extras Key 1",
        b"aeK2" => "Apple Extras Key 2",
        b"aeDL" => "Apple Extras Download",
        b"aeFA" => "Apple Extras Format Audio",
        b"aeXD" => "Apple Extras Extra Data",
        _ => return None,
    };

    Some(description)
}

/// Session and control codes of the `ssnc` type.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SsncCode {
    /// `pcst`: play/pause control flag, `"1"` playing, `"0"` paused.
    PlayControlState,
    /// `mdst`: a metadata bundle starts.
    MetadataStart,
    /// `mden`: a metadata bundle ends.
    MetadataEnd,
    /// `pbeg`: play session begins.
    PlayBegin,
    /// `pend`: play session ends.
    PlayEnd,
    /// `prsm`: play stream resumes.
    PlayResume,
    /// `pfls`: play stream flush.
    PlayFlush,
    /// `pffr`: first frame of the play stream received.
    FirstFrame,
    /// `pcen`: play stream connection ends.
    ConnectionEnd,
    /// `PICT`: cover art.
    Picture,
    /// `prgr`: progress as `start/current/end` RTP timestamps.
    Progress,
    /// `acre`: Active-Remote token.
    ActiveRemote,
    /// `daid`: DACP id.
    DacpId,
    /// `clip`: client IP address.
    ClientIp,
    /// `svip`: server IP address.
    ServerIp,
    /// `snam`: name of the sending device.
    ClientName,
    /// `snua`: user agent of the sender.
    UserAgent,
    /// `pvol`: volume.
    Volume,
    /// `disc`: client discovered.
    Discovered,
    /// `conn`: client connected.
    Connected,
    /// `abeg`: the receiver enters the active state.
    ActiveBegin,
    /// `aend`: the receiver exits the active state.
    ActiveEnd,
}

impl SsncCode {
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        let code = match &code.to_be_bytes() {
            b"pcst" => Self::PlayControlState,
            b"mdst" => Self::MetadataStart,
            b"mden" => Self::MetadataEnd,
            b"pbeg" => Self::PlayBegin,
            b"pend" => Self::PlayEnd,
            b"prsm" => Self::PlayResume,
            b"pfls" => Self::PlayFlush,
            b"pffr" => Self::FirstFrame,
            b"pcen" => Self::ConnectionEnd,
            b"PICT" => Self::Picture,
            b"prgr" => Self::Progress,
            b"acre" => Self::ActiveRemote,
            b"daid" => Self::DacpId,
            b"clip" => Self::ClientIp,
            b"svip" => Self::ServerIp,
            b"snam" => Self::ClientName,
            b"snua" => Self::UserAgent,
            b"pvol" => Self::Volume,
            b"disc" => Self::Discovered,
            b"conn" => Self::Connected,
            b"abeg" => Self::ActiveBegin,
            b"aend" => Self::ActiveEnd,
            _ => return None,
        };

        Some(code)
    }
}
