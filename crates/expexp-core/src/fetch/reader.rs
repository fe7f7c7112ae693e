//! Deadline-bound reader for files of unknown or misreported size.
//!
//! Files under `/proc` and `/sys` report a size of 0 but produce content when
//! read, and some of them misbehave when read in small pieces. The reader
//! therefore never trusts the reported size as an upper bound and always
//! starts with a reasonably large buffer.

use std::fs::{File, Metadata, OpenOptions};
use std::io::{self, Read};
use std::path::Path;
use std::time::{Instant, SystemTime};

use thiserror::Error;

use super::FetchError;

/// Smallest initial buffer. A `/proc` entry read with a 1-byte buffer returns
/// truncated or corrupted content.
pub const MIN_READ_CAPACITY: usize = 512;

/// Bytes read from a file together with its modification time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileContents {
    pub data: Vec<u8>,
    /// Only set for regular files whose metadata could be read.
    pub modified: Option<SystemTime>,
}

/// A read that stopped early. `contents` holds whatever was read before the
/// failure.
#[derive(Debug, Error)]
#[error("read stopped after {} bytes", .contents.data.len())]
pub struct PartialRead {
    pub contents: FileContents,
    #[source]
    pub source: FetchError,
}

impl PartialRead {
    fn new(data: Vec<u8>, modified: Option<SystemTime>, source: FetchError) -> Self {
        Self {
            contents: FileContents { data, modified },
            source,
        }
    }
}

/// Initial buffer capacity for a file whose stat reported `reported` bytes.
///
/// One extra byte is reserved so the read that observes end-of-file does not
/// force a reallocation. Sizes that do not fit in `isize` are treated as
/// unknown.
pub fn initial_capacity(reported: Option<u64>) -> usize {
    let size = reported
        .and_then(|len| isize::try_from(len).ok())
        .map(|len| len as usize)
        .unwrap_or(0);
    size.saturating_add(1).max(MIN_READ_CAPACITY)
}

/// Reads `path` to end-of-file, giving up once `deadline` has passed.
///
/// The deadline is checked before every read, and a descriptor with no data
/// ready (a pipe whose writer stays open) is waited on only until the
/// deadline, so the call always returns. Data read before a failure is kept
/// in the [`PartialRead`]. The file handle is closed on all return paths.
pub fn read_with_deadline(path: &Path, deadline: Instant) -> Result<FileContents, PartialRead> {
    let mut file = open_nonblocking(path).map_err(|source| {
        PartialRead::new(
            Vec::new(),
            None,
            FetchError::Open {
                path: path.to_path_buf(),
                source,
            },
        )
    })?;

    let metadata = file.metadata().ok();
    let modified = metadata.as_ref().and_then(regular_file_mtime);
    let capacity = initial_capacity(metadata.as_ref().map(Metadata::len));

    let mut data = Vec::with_capacity(capacity);
    loop {
        if Instant::now() > deadline {
            let read = data.len();
            return Err(PartialRead::new(
                data,
                modified,
                FetchError::DeadlineExceeded {
                    path: path.to_path_buf(),
                    read,
                },
            ));
        }

        if data.len() == data.capacity() {
            data.reserve(1);
        }
        let filled = data.len();
        data.resize(data.capacity(), 0);

        match file.read(&mut data[filled..]) {
            Ok(0) => {
                data.truncate(filled);
                return Ok(FileContents { data, modified });
            }
            Ok(n) => data.truncate(filled + n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => data.truncate(filled),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                data.truncate(filled);
                if let Err(source) = wait_readable(&file, deadline) {
                    return Err(PartialRead::new(
                        data,
                        modified,
                        FetchError::Read {
                            path: path.to_path_buf(),
                            source,
                        },
                    ));
                }
            }
            Err(source) => {
                data.truncate(filled);
                return Err(PartialRead::new(
                    data,
                    modified,
                    FetchError::Read {
                        path: path.to_path_buf(),
                        source,
                    },
                ));
            }
        }
    }
}

/// Opens `path` for reading. On unix the descriptor is non-blocking, so
/// opening a FIFO without a writer returns at once and pipe reads surface
/// `WouldBlock` instead of parking the thread past the deadline.
fn open_nonblocking(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_NONBLOCK);
    }
    options.open(path)
}

/// Sleeps until `file` is readable or `deadline` passes, whichever is first.
#[cfg(unix)]
fn wait_readable(file: &File, deadline: Instant) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let remaining = deadline.saturating_duration_since(Instant::now());
    // Round up so a timed-out poll always lands past the deadline.
    let timeout = i32::try_from(remaining.as_nanos().div_ceil(1_000_000)).unwrap_or(i32::MAX);
    let mut pollfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: a single valid pollfd; the descriptor stays owned by `file`.
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn wait_readable(_file: &File, _deadline: Instant) -> io::Result<()> {
    std::thread::yield_now();
    Ok(())
}

fn regular_file_mtime(metadata: &Metadata) -> Option<SystemTime> {
    if metadata.is_file() {
        metadata.modified().ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;
    use std::time::Duration;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_initial_capacity_small_sizes_use_minimum() {
        assert_eq!(initial_capacity(Some(0)), 512);
        assert_eq!(initial_capacity(Some(1)), 512);
        assert_eq!(initial_capacity(Some(511)), 512);
        assert_eq!(initial_capacity(None), 512);
    }

    #[test]
    fn test_initial_capacity_large_sizes_add_one() {
        assert_eq!(initial_capacity(Some(512)), 513);
        assert_eq!(initial_capacity(Some(4096)), 4097);
    }

    #[test]
    fn test_initial_capacity_oversized_is_unknown() {
        assert_eq!(initial_capacity(Some(u64::MAX)), 512);
    }

    #[test]
    fn test_read_whole_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"node_load1 0.5\n").unwrap();

        let contents = read_with_deadline(file.path(), far_deadline()).unwrap();
        assert_eq!(contents.data, b"node_load1 0.5\n");
        assert!(contents.modified.is_some());
    }

    #[test]
    fn test_read_file_larger_than_minimum() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| b'a' + (i % 26) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&payload).unwrap();

        let contents = read_with_deadline(file.path(), far_deadline()).unwrap();
        assert_eq!(contents.data, payload);
    }

    #[test]
    fn test_read_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let contents = read_with_deadline(file.path(), far_deadline()).unwrap();
        assert!(contents.data.is_empty());
        assert!(contents.modified.is_some());
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_with_deadline(&dir.path().join("absent"), far_deadline()).unwrap_err();
        assert!(matches!(err.source, FetchError::Open { .. }));
        assert!(err.contents.data.is_empty());
        assert!(err.contents.modified.is_none());
    }

    #[test]
    fn test_expired_deadline_returns_empty_data() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"up 1\n").unwrap();

        let deadline = Instant::now();
        thread::sleep(Duration::from_millis(5));

        let err = read_with_deadline(file.path(), deadline).unwrap_err();
        assert!(err.source.is_timeout());
        assert!(matches!(err.source, FetchError::DeadlineExceeded { read: 0, .. }));
        assert!(err.contents.data.is_empty());
    }

    #[test]
    fn test_directory_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_with_deadline(dir.path(), far_deadline()).unwrap_err();
        assert!(!err.source.is_timeout());
        // Directories are not regular files, so no mtime is reported.
        assert!(err.contents.modified.is_none());
    }

    #[cfg(unix)]
    fn make_fifo(dir: &Path) -> std::path::PathBuf {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = dir.join("pipe");
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
        path
    }

    /// Opens the write end without blocking on a reader.
    #[cfg(unix)]
    fn hold_writer(path: &Path) -> File {
        OpenOptions::new().read(true).write(true).open(path).unwrap()
    }

    /// Runs the reader on its own thread and fails if it outlives `limit`.
    #[cfg(unix)]
    fn read_on_thread(
        path: &Path,
        deadline: Instant,
        limit: Duration,
    ) -> Result<FileContents, PartialRead> {
        let (tx, rx) = std::sync::mpsc::channel();
        let path = path.to_path_buf();
        thread::spawn(move || {
            let _ = tx.send(read_with_deadline(&path, deadline));
        });
        rx.recv_timeout(limit)
            .expect("reader did not return after its deadline")
    }

    #[cfg(unix)]
    #[test]
    fn test_idle_pipe_stops_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = make_fifo(dir.path());
        let _writer = hold_writer(&fifo);

        let started = Instant::now();
        let err = read_on_thread(
            &fifo,
            started + Duration::from_millis(100),
            Duration::from_secs(3),
        )
        .unwrap_err();
        assert!(err.source.is_timeout());
        assert!(err.contents.data.is_empty());
        assert!(err.contents.modified.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[cfg(unix)]
    #[test]
    fn test_partial_pipe_data_is_kept_on_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = make_fifo(dir.path());
        let mut writer = hold_writer(&fifo);
        writer.write_all(b"node_load1 0.5\n").unwrap();

        let err = read_on_thread(
            &fifo,
            Instant::now() + Duration::from_millis(100),
            Duration::from_secs(3),
        )
        .unwrap_err();
        assert!(matches!(
            err.source,
            FetchError::DeadlineExceeded { read: 15, .. }
        ));
        assert_eq!(err.contents.data, b"node_load1 0.5\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_read_to_end_once_writer_closes() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = make_fifo(dir.path());
        // An idle read end keeps buffered data alive until the reader opens.
        let _keep = open_nonblocking(&fifo).unwrap();
        let mut writer = hold_writer(&fifo);
        writer.write_all(b"up 1\n").unwrap();

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.write_all(b"up 2\n").unwrap();
            drop(writer);
        });

        let contents = read_on_thread(&fifo, far_deadline(), Duration::from_secs(10)).unwrap();
        closer.join().unwrap();
        assert_eq!(contents.data, b"up 1\nup 2\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_proc_file_reporting_zero_size() {
        let path = Path::new("/proc/self/status");
        let meta = std::fs::metadata(path).unwrap();
        assert_eq!(meta.len(), 0);

        let contents = read_with_deadline(path, far_deadline()).unwrap();
        let text = String::from_utf8(contents.data).unwrap();
        assert!(text.contains("Name:"));
        assert!(text.contains("Pid:"));
    }
}
