//! Capturing and replaying the metadata stream.
//!
//! A capture is a JSON-lines file: a header, then every raw line received
//! from the pipe and every notable monitor [`Event`], then a footer. All
//! timestamps are in seconds; line and event timestamps are relative to the
//! start of the capture.
//!
//! ```text
//! {"type":"capture_header","version":"1.0","start_time":1760000000.0,"description":"..."}
//! {"type":"metadata_line","timestamp":0.5,"gap_since_last":0.5,"data":"<item>..."}
//! {"type":"event","timestamp":0.5,"event_type":"state_change","description":"..."}
//! {"type":"capture_footer","end_time":1760000060.0,"total_duration":60.0}
//! ```
//!
//! Captures whose path ends in `.gz` are written gzip-compressed. Replaying
//! detects compression by extension or magic bytes, and delivers the lines
//! as fast as the callback accepts them.

use std::{
    fs::{self, File},
    io::{BufRead, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    events::Event,
};

/// Version written to capture headers.
pub const CAPTURE_VERSION: &str = "1.0";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Receives raw lines and events from the monitor.
///
/// Sinks are best effort: failing to capture never interrupts monitoring,
/// so implementations log their own errors.
pub trait CaptureSink: Send {
    /// Called when the monitor starts.
    fn begin(&mut self) {}

    /// Called with every raw line, before it is parsed.
    fn line(&mut self, line: &str);

    fn event(&mut self, event: &Event);

    /// Called when the monitor stops.
    fn finish(&mut self) {}
}

/// One line of a capture file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Entry {
    CaptureHeader {
        version: String,
        #[serde(default)]
        start_time: f64,
        #[serde(default)]
        description: String,
    },
    MetadataLine {
        #[serde(default)]
        timestamp: f64,
        #[serde(default)]
        gap_since_last: f64,
        data: String,
    },
    Event {
        #[serde(default)]
        timestamp: f64,
        event_type: String,
        #[serde(default)]
        description: String,
    },
    CaptureFooter {
        #[serde(default)]
        end_time: f64,
        #[serde(default)]
        total_duration: f64,
    },
}

/// Writes a capture file.
pub struct Capture {
    path: PathBuf,
    writer: Box<dyn Write + Send>,
    started: Instant,
    last_activity: Instant,
    finished: bool,
}

impl Capture {
    /// Creates or truncates the capture file at `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = BufWriter::new(File::create(path)?);
        let writer: Box<dyn Write + Send> = if has_gz_extension(path) {
            Box::new(GzEncoder::new(file, Compression::default()))
        } else {
            Box::new(file)
        };

        info!("capturing metadata to {}", path.display());

        let now = Instant::now();
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            started: now,
            last_activity: now,
            finished: false,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_entry(&mut self, entry: &Entry) {
        let result = serde_json::to_writer(&mut self.writer, entry)
            .map_err(Error::from)
            .and_then(|()| {
                self.writer.write_all(b"\n")?;
                self.writer.flush()?;
                Ok(())
            });

        if let Err(e) = result {
            error!("failed to write to capture {}: {e}", self.path.display());
        }
    }
}

impl CaptureSink for Capture {
    fn begin(&mut self) {
        self.started = Instant::now();
        self.last_activity = self.started;
        self.finished = false;

        self.write_entry(&Entry::CaptureHeader {
            version: CAPTURE_VERSION.to_owned(),
            start_time: unix_time(),
            description: "shairport-sync metadata capture".to_owned(),
        });
    }

    fn line(&mut self, line: &str) {
        let now = Instant::now();
        let gap = now.duration_since(self.last_activity);
        self.last_activity = now;

        self.write_entry(&Entry::MetadataLine {
            timestamp: now.duration_since(self.started).as_secs_f64(),
            gap_since_last: gap.as_secs_f64(),
            data: line.trim().to_owned(),
        });
    }

    fn event(&mut self, event: &Event) {
        self.write_entry(&Entry::Event {
            timestamp: self.started.elapsed().as_secs_f64(),
            event_type: event.event_type().to_owned(),
            description: event.description(),
        });
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let duration = self.started.elapsed().as_secs_f64();
        self.write_entry(&Entry::CaptureFooter {
            end_time: unix_time(),
            total_duration: duration,
        });
        info!("stopped capture after {duration:.2} seconds");
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Summary of a capture file.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CaptureInfo {
    pub path: PathBuf,
    pub file_size: u64,
    pub compressed: bool,
    pub line_count: usize,
    pub event_count: usize,
    pub duration: f64,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

/// Reads a capture file back.
#[derive(Clone, Debug)]
pub struct Replay {
    path: PathBuf,
}

impl Replay {
    /// # Errors
    ///
    /// Returns `NotFound` if there is no file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::not_found(format!(
                "capture file {} not found",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Whether the file is gzip-compressed, by extension or content.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn is_gzipped(&self) -> Result<bool> {
        if has_gz_extension(&self.path) {
            return Ok(true);
        }

        let mut magic = [0; 2];
        let mut file = File::open(&self.path)?;
        let read = file.read(&mut magic)?;
        Ok(read == magic.len() && magic == GZIP_MAGIC)
    }

    /// Calls `on_line` with every captured line and `on_event` with the
    /// type, description and timestamp of every captured event, in file
    /// order. Returns the number of lines replayed.
    ///
    /// Lines of the file that are not valid entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn replay<L, E>(&self, mut on_line: L, mut on_event: E) -> Result<usize>
    where
        L: FnMut(&str),
        E: FnMut(&str, &str, f64),
    {
        let mut replayed = 0;

        self.for_each_entry(|entry| match entry {
            Entry::CaptureHeader {
                version,
                description,
                ..
            } => debug!("replaying capture version {version}: {description}"),
            Entry::MetadataLine { data, .. } => {
                trace!("replaying line: {data}");
                on_line(&data);
                replayed += 1;
            }
            Entry::Event {
                timestamp,
                event_type,
                description,
            } => {
                debug!("replaying event at {timestamp:.2}s: {event_type}: {description}");
                on_event(&event_type, &description, timestamp);
            }
            Entry::CaptureFooter { total_duration, .. } => {
                debug!("capture lasted {total_duration:.2} seconds");
            }
        })?;

        info!("replayed {replayed} lines from {}", self.path.display());
        Ok(replayed)
    }

    /// Summarizes the capture without replaying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn info(&self) -> Result<CaptureInfo> {
        let mut info = CaptureInfo {
            path: self.path.clone(),
            file_size: fs::metadata(&self.path)?.len(),
            compressed: self.is_gzipped()?,
            ..CaptureInfo::default()
        };

        self.for_each_entry(|entry| match entry {
            Entry::CaptureHeader { start_time, .. } => info.start_time = Some(start_time),
            Entry::MetadataLine { .. } => info.line_count += 1,
            Entry::Event { .. } => info.event_count += 1,
            Entry::CaptureFooter {
                end_time,
                total_duration,
            } => {
                info.end_time = Some(end_time);
                info.duration = total_duration;
            }
        })?;

        Ok(info)
    }

    fn for_each_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(Entry),
    {
        let file = File::open(&self.path)?;
        let reader: Box<dyn BufRead> = if self.is_gzipped()? {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<Entry>(line) {
                Ok(entry) => f(entry),
                Err(e) => debug!("skipping line {} of capture: {e}", number + 1),
            }
        }

        Ok(())
    }
}

fn has_gz_extension(path: &Path) -> bool {
    path.extension().is_some_and(|extension| extension == "gz")
}

fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
