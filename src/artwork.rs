//! Cover art storage.
//!
//! Cover art arrives as raw image bytes. The file type is sniffed from the
//! magic bytes, and the file name is derived from the album and the content
//! so that the same image for the same album is written only once:
//!
//! ```text
//! {prefix}{album}_{checksum}.{extension}
//! ```

use std::{
    fmt::Write as _,
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
};

use md5::{Digest, Md5};

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Album name used when no album is known.
pub const UNKNOWN_ALBUM: &str = "unknown_album";

/// Album names are truncated to this many characters.
const MAX_ALBUM_LEN: usize = 30;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Heic,
    Heif,
    Unknown,
}

impl ImageFormat {
    /// Determines the format from the leading bytes of an image.
    #[must_use]
    pub fn sniff(data: &[u8]) -> Self {
        const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

        if data.starts_with(&[0xff, 0xd8, 0xff]) {
            return Self::Jpeg;
        }

        if data.starts_with(PNG_SIGNATURE) {
            return Self::Png;
        }

        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Self::Gif;
        }

        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Self::Webp;
        }

        // ISO base media file: a box size followed by the `ftyp` box type and
        // the major brand.
        if data.len() >= 12 && &data[4..8] == b"ftyp" {
            match &data[8..12] {
                b"heic" | b"heix" | b"hevc" | b"hevx" => return Self::Heic,
                b"mif1" | b"msf1" => return Self::Heif,
                _ => {}
            }
        }

        Self::Unknown
    }

    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Heic => "heic",
            Self::Heif => "heif",
            Self::Unknown => "bin",
        }
    }
}

/// First eight hexadecimal digits of the MD5 digest of `data`.
#[must_use]
pub fn checksum(data: &[u8]) -> String {
    let digest = Md5::digest(data);
    digest[..4].iter().fold(String::with_capacity(8), |mut hex, byte| {
        let _ = write!(hex, "{byte:02x}");
        hex
    })
}

/// Makes an album name safe for use in a file name.
///
/// Characters other than alphanumerics, `_`, `-` and `.` are replaced with
/// `_`, and the result is truncated to 30 characters.
#[must_use]
pub fn sanitize_album(album: Option<&str>) -> String {
    let album = match album {
        Some(album) if !album.is_empty() => album,
        _ => UNKNOWN_ALBUM,
    };

    album
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_ALBUM_LEN)
        .collect()
}

/// Outcome of [`ArtworkStore::save`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Saved {
    pub path: PathBuf,
    /// `false` if a file with the same name already existed.
    pub written: bool,
}

#[derive(Clone, Debug)]
pub struct ArtworkStore {
    dir: PathBuf,
    prefix: String,
    max_size: usize,
}

impl ArtworkStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, max_size: usize) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            max_size,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.cover_art_dir,
            &config.cover_art_prefix,
            config.max_cover_art_size,
        )
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file name for `data` belonging to `album`. This is a pure function
    /// of the sanitized album name and the content.
    #[must_use]
    pub fn file_name(&self, album: Option<&str>, data: &[u8]) -> String {
        format!(
            "{}{}_{}.{}",
            self.prefix,
            sanitize_album(album),
            checksum(data),
            ImageFormat::sniff(data).extension()
        )
    }

    /// Writes `data` unless a file with the same name already exists.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if `data` is larger than the configured
    /// maximum, or the I/O error that occurred while writing.
    pub fn save(&self, album: Option<&str>, data: &[u8]) -> Result<Saved> {
        if data.len() > self.max_size {
            return Err(Error::resource_exhausted(format!(
                "cover art of {} bytes exceeds {} bytes",
                data.len(),
                self.max_size
            )));
        }

        let path = self.dir.join(self.file_name(album, data));

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                if let Err(e) = file.write_all(data) {
                    // Do not leave a truncated image behind under a name that
                    // claims its content.
                    let _ = std::fs::remove_file(&path);
                    return Err(e.into());
                }

                Ok(Saved {
                    path,
                    written: true,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Saved {
                path,
                written: false,
            }),
            Err(e) => Err(e.into()),
        }
    }
}
