//! Metadata bundles.
//!
//! A bundle is one coherent snapshot of now-playing fields. shairport-sync
//! brackets the fields of a track with bundle-start and bundle-end signals;
//! every bundle gets a fresh [`MetadataId`] and a sequence number that grows
//! with every dispatch, including cover art updates of the same bundle.

use std::{collections::BTreeMap, fmt, ops::Deref, str::FromStr};

use serde::Serialize;

use crate::error::Error;

/// Field set to the place cover art of the bundle was written to.
pub const COVER_ART_PATH: &str = "cover_art_path";

/// Fields that a session-end bundle explicitly blanks out.
pub const DISPLAY_FIELDS: [&str; 5] = ["artist", "album", "title", "genre", COVER_ART_PATH];

/// Random identity of a bundle.
///
/// Identities only need to be unique for a process lifetime, so they are
/// generated with `fastrand` instead of a cryptographically secure source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MetadataId(uuid::Uuid);

impl MetadataId {
    #[must_use]
    pub fn fast_v4() -> Self {
        let random_bytes = fastrand::u128(..).to_ne_bytes();
        Self(uuid::Builder::from_random_bytes(random_bytes).into_uuid())
    }
}

impl Deref for MetadataId {
    type Target = uuid::Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for MetadataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MetadataId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::from_str(s)
            .map(Self)
            .map_err(|e| Error::invalid_argument(format!("invalid metadata id {s}: {e}")))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Bundle {
    #[serde(rename = "metadata_id")]
    pub id: MetadataId,
    #[serde(rename = "sequence_number")]
    pub sequence: u64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, String>,
}

impl Bundle {
    #[must_use]
    pub fn new(id: MetadataId, sequence: u64, fields: BTreeMap<String, String>) -> Self {
        Self {
            id,
            sequence,
            fields,
        }
    }

    /// The bundle dispatched when a session has fully ended.
    ///
    /// It has a fresh identity, sequence number zero, and blank display
    /// fields so that consumers clear what they show.
    #[must_use]
    pub fn session_end() -> Self {
        let fields = DISPLAY_FIELDS
            .iter()
            .map(|field| ((*field).to_owned(), String::new()))
            .collect();

        Self::new(MetadataId::fast_v4(), 0, fields)
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    #[must_use]
    pub fn cover_art_path(&self) -> Option<&str> {
        self.get(COVER_ART_PATH).filter(|path| !path.is_empty())
    }

    /// Whether every field is blank, as in a session-end bundle.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.fields.values().all(String::is_empty)
    }

    /// Flattens the bundle into a string mapping, with the identity under
    /// `metadata_id` and the sequence under `sequence_number`.
    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.fields.clone();
        map.insert("metadata_id".to_owned(), self.id.to_string());
        map.insert("sequence_number".to_owned(), self.sequence.to_string());
        map
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.sequence, self.id)?;
        for (field, value) in &self.fields {
            write!(f, " {field}={value:?}")?;
        }
        Ok(())
    }
}
