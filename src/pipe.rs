//! Bounded in-memory byte pipe connecting a producer thread to a reader.
//!
//! Data moves in chunks of at most [`CHUNK_SIZE`] bytes through a
//! `sync_channel`, so a writer blocks once [`DEFAULT_CAPACITY`] chunks are
//! queued. A writer can end the stream with an error through its
//! [`PipeCloser`]; the reader returns that error after the data already
//! queued, and keeps failing with the same kind on later reads.

use crate::error::{Error, Result};
use log::debug;
use std::io::{self, BufWriter, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use tar_rs as tar;

pub const CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_CAPACITY: usize = 16;

type Chunk = io::Result<Vec<u8>>;

pub fn pipe() -> (PipeReader, PipeWriter) {
    pipe_with_capacity(DEFAULT_CAPACITY)
}

pub fn pipe_with_capacity(chunks: usize) -> (PipeReader, PipeWriter) {
    let (tx, rx) = mpsc::sync_channel(chunks);
    let reader = PipeReader {
        rx,
        chunk: Vec::new(),
        pos: 0,
        failed: None,
    };
    let writer = PipeWriter {
        tx,
        closed: Arc::new(AtomicBool::new(false)),
    };
    (reader, writer)
}

pub struct PipeWriter {
    tx: SyncSender<Chunk>,
    closed: Arc<AtomicBool>,
}

impl PipeWriter {
    pub fn closer(&self) -> PipeCloser {
        PipeCloser {
            tx: self.tx.clone(),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe closed with error",
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(CHUNK_SIZE);
        self.tx
            .send(Ok(buf[..n].to_vec()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Ends a pipe with an error while its writer may still be borrowed elsewhere.
pub struct PipeCloser {
    tx: SyncSender<Chunk>,
    closed: Arc<AtomicBool>,
}

impl PipeCloser {
    /// Queue `err` for the reader. Writes made afterwards fail with `BrokenPipe`.
    pub fn close_with_error(self, err: io::Error) {
        self.closed.store(true, Ordering::SeqCst);
        // a dropped reader has nobody to tell
        let _ = self.tx.send(Err(err));
    }
}

pub struct PipeReader {
    rx: Receiver<Chunk>,
    chunk: Vec<u8>,
    pos: usize,
    failed: Option<(io::ErrorKind, String)>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if let Some((kind, msg)) = &self.failed {
                return Err(io::Error::new(*kind, msg.clone()));
            }
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(err)) => {
                    self.failed = Some((err.kind(), err.to_string()));
                    return Err(err);
                }
                // every writer is gone
                Err(_) => return Ok(0),
            }
        }
    }
}

/// Run `produce` on a named thread that writes a tar stream into a pipe.
///
/// On success the end-of-archive trailer is written and the pipe closes
/// cleanly. On failure the pipe closes with the error, and no trailer follows.
pub(crate) fn spawn_tar_producer<F>(name: &str, produce: F) -> Result<PipeReader>
where
    F: FnOnce(&mut tar::Builder<BufWriter<PipeWriter>>) -> Result<()> + Send + 'static,
{
    let (reader, writer) = pipe();
    let closer = writer.closer();
    let stage = name.to_string();

    thread::Builder::new()
        .name(stage.clone())
        .spawn(move || {
            let mut builder = tar::Builder::new(BufWriter::with_capacity(CHUNK_SIZE, writer));
            // A panic must not look like a clean end of stream to the reader.
            let produced = panic::catch_unwind(AssertUnwindSafe(|| produce(&mut builder)))
                .unwrap_or_else(|_| {
                    Err(Error::io(
                        "run",
                        &stage,
                        io::Error::new(io::ErrorKind::Other, "producer thread panicked"),
                    ))
                });
            let res = produced.and_then(|()| {
                builder
                    .finish()
                    .map_err(|e| Error::from_append("archive trailer", e))?;
                builder
                    .get_mut()
                    .flush()
                    .map_err(|e| Error::from_append("archive trailer", e))
            });
            if let Err(err) = res {
                debug!("{} stage failed: {}", stage, err);
                closer.close_with_error(err.into_io());
            }
        })
        .map_err(|e| Error::io("spawn", name, e))?;

    Ok(reader)
}
