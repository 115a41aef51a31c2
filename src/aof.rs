/*!
 * Append-Only File (AOF) Persistence
 *
 * Every successful mutating command is logged as the RESP array a client
 * would send, so the log is just a concatenation of wire frames. On
 * startup the whole file is replayed through the same codec to rebuild
 * the store, after which the handle only ever appends.
 *
 * The read → append transition happens exactly once: `Aof::replay` is the
 * only way to obtain an `Aof`, and it returns one only after the whole
 * file has been applied.
 */

use crate::config::FsyncPolicy;
use crate::error::AofError;
use crate::protocol::{self, Frame};
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Bytes pulled from the log per read while replaying
const READ_CHUNK: usize = 64 * 1024;

const EVERYSEC: Duration = Duration::from_millis(1000);

/// Receives log records, in file order, while the log is replayed
pub trait ReplaySink {
    type Error: Display;

    fn apply(&mut self, record: Frame) -> Result<(), Self::Error>;
}

/// The append side of the log: a byte sink that can be cut back and synced
pub(crate) trait LogFile: Write + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Handle to an append-mode log file
///
/// Appends are serialized by an internal lock that is independent of the
/// store's lock.
pub struct Aof {
    path: PathBuf,
    fsync: FsyncPolicy,
    replayed: u64,
    writer: Mutex<Writer>,
}

struct Writer {
    file: Box<dyn LogFile>,
    /// Length of the file after the last complete record
    len: u64,
    last_sync: Instant,
}

impl Aof {
    /// Replay an existing log into `sink`, then open it for appending
    ///
    /// The file is created if it does not exist. Any decode failure, a
    /// truncated final record, a record that is not an array of bulk
    /// strings, or a record the sink rejects aborts the replay: a partly
    /// applied log is never handed back.
    ///
    /// # Arguments
    /// * `path` - Log file location
    /// * `fsync` - Sync policy for subsequent appends
    /// * `sink` - Receiver for each record, in order
    pub fn replay<S>(path: impl AsRef<Path>, fsync: FsyncPolicy, sink: &mut S) -> Result<Self, AofError>
    where
        S: ReplaySink + ?Sized,
    {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        log::info!("replaying aof {}", path.display());
        let started = Instant::now();

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut offset: u64 = 0;
        let mut index: u64 = 0;

        loop {
            let n = match file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                let (record, used) = match protocol::decode(&buf[..]) {
                    Ok(Some(decoded)) => decoded,
                    Ok(None) => break,
                    Err(source) => return Err(AofError::Corrupt { offset, source }),
                };
                if record.to_command_args().is_none() {
                    return Err(AofError::InvalidRecord { index });
                }
                sink.apply(record).map_err(|e| AofError::Rejected {
                    index,
                    reason: e.to_string(),
                })?;

                buf.advance(used);
                offset += used as u64;
                index += 1;
            }
        }

        if !buf.is_empty() {
            return Err(AofError::Truncated { offset, trailing: buf.len() });
        }

        log::info!(
            "aof replay finished: {} records, {} bytes in {:?}",
            index,
            offset,
            started.elapsed()
        );

        Ok(Self {
            path,
            fsync,
            replayed: index,
            writer: Mutex::new(Writer { file: Box::new(file), len: offset, last_sync: Instant::now() }),
        })
    }

    /// Append one record and flush it before returning
    ///
    /// Concurrent callers are serialized, so records land in a single
    /// total order. If the write fails part-way, the file is cut back to
    /// the end of the previous record so a later replay does not trip over
    /// a torn tail.
    pub fn append(&self, record: &Frame) -> Result<(), AofError> {
        let mut bytes = BytesMut::new();
        record.encode(&mut bytes);

        let mut w = self.writer.lock();
        if let Err(e) = w.file.write_all(&bytes).and_then(|_| w.file.flush()) {
            let len = w.len;
            if let Err(trunc) = w.file.truncate(len) {
                log::error!("aof rollback to {} bytes failed: {}", len, trunc);
            }
            return Err(e.into());
        }
        w.len += bytes.len() as u64;

        match self.fsync {
            FsyncPolicy::Always => w.file.sync()?,
            FsyncPolicy::EverySec if w.last_sync.elapsed() >= EVERYSEC => {
                w.file.sync()?;
                w.last_sync = Instant::now();
            }
            FsyncPolicy::EverySec | FsyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Wrap an already-positioned log file without replaying anything
    #[cfg(test)]
    pub(crate) fn from_file(file: impl LogFile + 'static, fsync: FsyncPolicy) -> Self {
        Self {
            path: PathBuf::from("<memory>"),
            fsync,
            replayed: 0,
            writer: Mutex::new(Writer { file: Box::new(file), len: 0, last_sync: Instant::now() }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records applied by the startup replay
    pub fn replayed(&self) -> u64 {
        self.replayed
    }

    /// Current size of the log in bytes
    pub fn len(&self) -> u64 {
        self.writer.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
