//! # Strictly-Ordered Asynchronous File Channel
//!
//! [`AsyncFileIo`] wraps a file in an asynchronous execution channel while
//! presenting synchronous semantics to callers: a dedicated worker thread
//! owns the file descriptor and executes one request at a time; the
//! calling thread blocks until its request completes.
//!
//! ## Why One Operation In Flight
//!
//! The WAL depends on write ordering: frame N must be on its way to disk
//! before frame N+1 is issued, and the position cursor shared by
//! unpositioned reads/writes must advance in issue order. Allowing a
//! second operation to launch before the first completes would let
//! completions interleave and corrupt both. The submission lock makes the
//! "wait for the previous operation" rule structural: a caller cannot even
//! hand its request to the worker until the prior caller has collected its
//! completion.
//!
//! ## Failure Behavior
//!
//! A failed completion surfaces as an error to the blocked caller. The
//! in-flight slot is the submission lock's critical section, so it is
//! released on every path - success, I/O error, or a dead worker - and the
//! handle stays usable for subsequent calls.
//!
//! ## Cursor Semantics
//!
//! Unpositioned `read`/`write` advance the internal cursor by the number
//! of bytes actually transferred. A read that hits end-of-stream
//! transfers nothing and leaves the cursor unchanged. Positioned variants
//! never touch the cursor.
//!
//! ## Shutdown
//!
//! `close` posts a shutdown request and returns without waiting (the
//! caller guarantees no operation is outstanding, usually by owning the
//! handle exclusively). `Drop` closes and joins the worker so tests and
//! short-lived tools never leak threads.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::trace;

enum IoRequest {
    Read { offset: u64, len: usize },
    Write { offset: u64, data: Vec<u8> },
    Force { metadata: bool },
    Truncate { len: u64 },
    Size,
    Shutdown,
}

/// Worker-side result of one request.
enum IoOutcome {
    Transferred { count: usize, data: Option<Vec<u8>> },
    Size(u64),
    Done,
}

struct IoTask {
    request: IoRequest,
    reply: mpsc::Sender<io::Result<IoOutcome>>,
}

/// Asynchronous file channel with exactly one operation in flight.
pub struct AsyncFileIo {
    path: PathBuf,
    sender: mpsc::Sender<IoTask>,
    worker: Option<JoinHandle<()>>,
    /// Serializes submissions: the holder owns the in-flight slot.
    submit: Mutex<()>,
    position: AtomicU64,
}

impl AsyncFileIo {
    /// Creates (truncating) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create file '{}'", path.display()))?;

        Ok(Self::spawn(file, path.to_path_buf(), None))
    }

    /// Opens an existing file at `path`; the cursor starts at 0.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;

        Ok(Self::spawn(file, path.to_path_buf(), None))
    }

    /// Test hook: every completion is delayed by `delay`, proving callers
    /// order correctly even under slow completions.
    #[cfg(test)]
    fn create_with_completion_delay<P: AsRef<Path>>(path: P, delay: Duration) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create file '{}'", path.display()))?;

        Ok(Self::spawn(file, path.to_path_buf(), Some(delay)))
    }

    fn spawn(file: File, path: PathBuf, delay: Option<Duration>) -> Self {
        let (sender, receiver) = mpsc::channel::<IoTask>();

        let worker = std::thread::Builder::new()
            .name("pagecore-file-io".into())
            .spawn(move || worker_loop(file, receiver, delay))
            .expect("failed to spawn file I/O worker");

        Self {
            path,
            sender,
            worker: Some(worker),
            submit: Mutex::new(()),
            position: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current cursor of the unpositioned read/write variants.
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Submits one request and blocks until its completion arrives. The
    /// submission lock is the in-flight slot: held across send + receive,
    /// released on every path.
    fn submit(&self, request: IoRequest) -> Result<IoOutcome> {
        let _slot = self.submit.lock();
        self.exchange(request)
    }

    /// Sends one request and waits for its completion. Caller holds the
    /// submission lock.
    fn exchange(&self, request: IoRequest) -> Result<IoOutcome> {
        let (reply, completion) = mpsc::channel();
        self.sender
            .send(IoTask { request, reply })
            .map_err(|_| eyre::eyre!("file I/O worker for '{}' is gone", self.path.display()))?;

        let outcome = completion.recv().map_err(|_| {
            eyre::eyre!(
                "file I/O worker for '{}' died mid-operation",
                self.path.display()
            )
        })?;

        outcome.wrap_err_with(|| format!("I/O failure on '{}'", self.path.display()))
    }

    /// Reads into `buf` at the file offset `offset`; returns bytes read
    /// (possibly short at end of file). Does not move the cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self.submit(IoRequest::Read {
            offset,
            len: buf.len(),
        })? {
            IoOutcome::Transferred { count, data } => {
                let data = data.expect("read completion carries data");
                buf[..count].copy_from_slice(&data[..count]);
                Ok(count)
            }
            _ => unreachable!("read completion shape"),
        }
    }

    /// Writes all of `data` at the file offset `offset`. Does not move the
    /// cursor.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        match self.submit(IoRequest::Write {
            offset,
            data: data.to_vec(),
        })? {
            IoOutcome::Transferred { count, .. } => Ok(count),
            _ => unreachable!("write completion shape"),
        }
    }

    /// Reads at the cursor, advancing it by the bytes transferred. End of
    /// stream transfers 0 bytes and leaves the cursor unchanged.
    ///
    /// Cursor load and advance happen inside the in-flight slot, so
    /// concurrent unpositioned calls see a strictly sequential cursor.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let _slot = self.submit.lock();
        let offset = self.position.load(Ordering::Acquire);

        match self.exchange(IoRequest::Read {
            offset,
            len: buf.len(),
        })? {
            IoOutcome::Transferred { count, data } => {
                let data = data.expect("read completion carries data");
                buf[..count].copy_from_slice(&data[..count]);
                self.position.fetch_add(count as u64, Ordering::AcqRel);
                Ok(count)
            }
            _ => unreachable!("read completion shape"),
        }
    }

    /// Writes at the cursor, advancing it by the bytes transferred.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let _slot = self.submit.lock();
        let offset = self.position.load(Ordering::Acquire);

        match self.exchange(IoRequest::Write {
            offset,
            data: data.to_vec(),
        })? {
            IoOutcome::Transferred { count, .. } => {
                self.position.fetch_add(count as u64, Ordering::AcqRel);
                Ok(count)
            }
            _ => unreachable!("write completion shape"),
        }
    }

    /// Flushes file contents (and metadata when `metadata` is set) to
    /// durable storage. Any prior operation has already completed by the
    /// single-slot rule.
    pub fn force(&self, metadata: bool) -> Result<()> {
        self.submit(IoRequest::Force { metadata })?;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> Result<u64> {
        match self.submit(IoRequest::Size)? {
            IoOutcome::Size(size) => Ok(size),
            _ => unreachable!("size completion shape"),
        }
    }

    /// Truncates the file to zero bytes and rewinds the cursor.
    pub fn clear(&self) -> Result<()> {
        self.submit(IoRequest::Truncate { len: 0 })?;
        self.position.store(0, Ordering::Release);
        Ok(())
    }

    /// Posts shutdown to the worker without waiting for it to exit. The
    /// caller must ensure no operation is concurrently outstanding.
    pub fn close(&self) {
        let reply = {
            let (reply, _discard) = mpsc::channel();
            reply
        };
        let _ = self.sender.send(IoTask {
            request: IoRequest::Shutdown,
            reply,
        });
    }
}

impl Drop for AsyncFileIo {
    fn drop(&mut self) {
        self.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for AsyncFileIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncFileIo")
            .field("path", &self.path)
            .field("position", &self.position())
            .finish()
    }
}

fn worker_loop(file: File, receiver: mpsc::Receiver<IoTask>, delay: Option<Duration>) {
    while let Ok(task) = receiver.recv() {
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let outcome = match task.request {
            IoRequest::Read { offset, len } => execute_read(&file, offset, len),
            IoRequest::Write { offset, data } => execute_write(&file, offset, &data),
            IoRequest::Force { metadata } => {
                let result = if metadata {
                    file.sync_all()
                } else {
                    file.sync_data()
                };
                result.map(|_| IoOutcome::Done)
            }
            IoRequest::Truncate { len } => file.set_len(len).map(|_| IoOutcome::Done),
            IoRequest::Size => file.metadata().map(|m| IoOutcome::Size(m.len())),
            IoRequest::Shutdown => {
                trace!("file I/O worker shutting down");
                break;
            }
        };

        // A caller that gave up waiting is gone; nothing to deliver to.
        let _ = task.reply.send(outcome);
    }
}

fn execute_read(file: &File, offset: u64, len: usize) -> io::Result<IoOutcome> {
    let mut data = vec![0u8; len];
    let mut filled = 0usize;

    while filled < len {
        match file.read_at(&mut data[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(IoOutcome::Transferred {
        count: filled,
        data: Some(data),
    })
}

fn execute_write(file: &File, offset: u64, data: &[u8]) -> io::Result<IoOutcome> {
    file.write_all_at(data, offset)?;
    Ok(IoOutcome::Transferred {
        count: data.len(),
        data: None,
    })
}
