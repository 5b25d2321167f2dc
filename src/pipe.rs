//! Reading the metadata pipe.
//!
//! The pipe is read line by line, with a bounded wait for read-readiness so
//! that the reader thread can notice a stop request without data arriving.
//! Opening does not block waiting for a writer.

use std::{
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::{fs::OpenOptionsExt, io::AsRawFd};

pub struct Pipe {
    reader: BufReader<File>,
    closed: Arc<AtomicBool>,
}

/// Closes a [`Pipe`] from another thread.
///
/// The file descriptor itself is released by the thread that owns the pipe,
/// so that it cannot be reused while a read is in progress.
#[derive(Clone, Debug)]
pub struct Closer(Arc<AtomicBool>);

impl Closer {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl Pipe {
    /// Opens the pipe at `path` for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` cannot be opened.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true);

        // A FIFO blocks on open until a writer appears. Open it non-blocking
        // and switch back to blocking reads once it is open.
        #[cfg(unix)]
        options.custom_flags(libc::O_NONBLOCK);

        let file = options.open(path)?;

        #[cfg(unix)]
        set_blocking(&file)?;

        Ok(Self {
            reader: BufReader::new(file),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    #[must_use]
    pub fn closer(&self) -> Closer {
        Closer(Arc::clone(&self.closed))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for a line to become readable.
    ///
    /// Returns `false` on timeout or when the pipe has been closed. Hang-ups
    /// count as readable: the next read reports end of file.
    ///
    /// # Errors
    ///
    /// Returns an error if polling fails.
    pub fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }

        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }

        #[cfg(unix)]
        {
            let mut fds = libc::pollfd {
                fd: self.reader.get_ref().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

            // SAFETY: `fds` is a single valid `pollfd` that outlives the call.
            let ready = unsafe { libc::poll(&mut fds, 1, millis) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(err);
            }

            Ok(ready > 0 && !self.is_closed())
        }

        // Without `poll` the read itself blocks.
        #[cfg(not(unix))]
        {
            let _ = timeout;
            Ok(true)
        }
    }

    /// Reads the next line, including its terminator.
    ///
    /// Returns `None` at end of file or when the pipe has been closed. Invalid
    /// UTF-8 is replaced rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that occurred while reading.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }

        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

#[cfg(unix)]
fn set_blocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();

    // SAFETY: `fd` is owned by `file` and open for the duration of both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_lines_of_regular_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"first\nsecond\nno newline").unwrap();

        let mut pipe = Pipe::open(file.path()).unwrap();
        assert!(pipe.wait_readable(Duration::from_millis(10)).unwrap());
        assert_eq!(pipe.read_line().unwrap().as_deref(), Some("first\n"));
        assert!(pipe.wait_readable(Duration::from_millis(10)).unwrap());
        assert_eq!(pipe.read_line().unwrap().as_deref(), Some("second\n"));
        assert_eq!(pipe.read_line().unwrap().as_deref(), Some("no newline"));
        assert_eq!(pipe.read_line().unwrap(), None);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"caf\xe9\n").unwrap();

        let mut pipe = Pipe::open(file.path()).unwrap();
        assert_eq!(pipe.read_line().unwrap().as_deref(), Some("caf\u{fffd}\n"));
    }

    #[test]
    fn closed_pipe_reads_nothing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"line\n").unwrap();

        let mut pipe = Pipe::open(file.path()).unwrap();
        pipe.closer().close();
        assert!(pipe.is_closed());
        assert!(!pipe.wait_readable(Duration::from_millis(10)).unwrap());
        assert_eq!(pipe.read_line().unwrap(), None);
    }

    #[test]
    fn missing_path_is_not_found() {
        let err = Pipe::open(Path::new("/nonexistent/shairport-sync-metadata")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn fifo_without_writer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata");
        let c_path = std::ffi::CString::new(path.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let mut pipe = Pipe::open(&path).unwrap();
        assert!(!pipe.wait_readable(Duration::from_millis(20)).unwrap());
    }
}
