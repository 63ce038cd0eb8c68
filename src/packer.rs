//! Serialize a directory tree into a tar stream.
//!
//! The walk runs on its own thread and writes through a bounded pipe, so the
//! caller can start consuming the archive before the walk is done. Children
//! are visited in file-name order, which makes repeated packs of an unchanged
//! tree byte-identical.

use crate::cancel::Cancellation;
use crate::entry::{EntryKind, TarEntry};
use crate::error::{Error, Result};
use crate::pipe::{self, PipeReader, PipeWriter};
use crate::platform::split_device;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tar_rs as tar;
use walkdir::WalkDir;

/// Tar bytes produced by [`pack`].
///
/// A failed or cancelled pack surfaces as a read error; use
/// [`Error::from_stream`] to recover the original [`Error`].
pub struct PackStream {
    reader: PipeReader,
}

impl Read for PackStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Start packing `source_root`. The root itself is not part of the archive.
pub fn pack(cancel: &Cancellation, source_root: impl AsRef<Path>) -> Result<PackStream> {
    let root = source_root.as_ref().to_path_buf();
    let meta = fs::metadata(&root).map_err(|e| Error::OpenFailure {
        path: root.clone(),
        source: e,
    })?;
    if !meta.is_dir() {
        return Err(Error::OpenFailure {
            path: root,
            source: io::Error::from_raw_os_error(libc::ENOTDIR),
        });
    }

    debug!("Packing {}", root.display());
    let cancel = cancel.clone();
    let reader = pipe::spawn_tar_producer("layertar-pack", move |builder| {
        write_tree(&cancel, &root, builder)
    })?;
    Ok(PackStream { reader })
}

fn write_tree(
    cancel: &Cancellation,
    root: &Path,
    builder: &mut tar::Builder<BufWriter<PipeWriter>>,
) -> Result<()> {
    // (dev, ino) -> archive name of the first occurrence
    let mut seen_links: HashMap<(u64, u64), PathBuf> = HashMap::new();
    let mut count = 0usize;

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for item in walker {
        cancel.check()?;

        let item = item.map_err(|e| walk_error(root, e))?;
        let path = item.path();
        let name = path
            .strip_prefix(root)
            .map_err(|_| Error::corrupt(format!("{} is outside {}", path.display(), root.display())))?
            .to_path_buf();
        let meta = item.metadata().map_err(|e| walk_error(root, e))?;

        let entry = entry_for(path, name, &meta, &mut seen_links)?;
        trace!(
            "Packing entry: path={}, kind={:?}, mode={:o}, size={}",
            entry.name.display(),
            entry.kind,
            entry.mode,
            entry.size
        );

        if entry.kind == EntryKind::Regular {
            let file = File::open(path).map_err(|e| Error::OpenFailure {
                path: path.to_path_buf(),
                source: e,
            })?;
            let body = SizedReader::new(file, entry.size, path);
            entry.append_to(builder, body)?;
        } else {
            entry.append_to(builder, io::empty())?;
        }
        count += 1;
    }

    debug!("Packed {} entries from {}", count, root.display());
    Ok(())
}

fn entry_for(
    path: &Path,
    name: PathBuf,
    meta: &fs::Metadata,
    seen_links: &mut HashMap<(u64, u64), PathBuf>,
) -> Result<TarEntry> {
    let file_type = meta.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Directory
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_file() {
        EntryKind::Regular
    } else if file_type.is_block_device() {
        EntryKind::BlockDevice
    } else if file_type.is_char_device() {
        EntryKind::CharDevice
    } else if file_type.is_fifo() {
        EntryKind::Fifo
    } else {
        let kind = if file_type.is_socket() {
            "socket"
        } else {
            "unknown"
        };
        return Err(Error::UnsupportedEntryType {
            name: name.display().to_string(),
            kind: kind.to_string(),
        });
    };

    let mut entry = TarEntry::new(name, kind);
    entry.mode = meta.mode() & 0o7777;
    entry.uid = u64::from(meta.uid());
    entry.gid = u64::from(meta.gid());
    entry.mtime = meta.mtime().max(0) as u64;
    entry.atime = Some(meta.atime().max(0) as u64);

    entry.xattrs = read_xattrs(path)?;

    match kind {
        EntryKind::Symlink => {
            let target = fs::read_link(path).map_err(|e| Error::io("read link", path, e))?;
            entry.link_target = Some(target);
        }
        EntryKind::Regular if meta.nlink() > 1 => {
            let key = (meta.dev(), meta.ino());
            match seen_links.get(&key) {
                Some(first) => {
                    entry.kind = EntryKind::HardLink;
                    entry.link_target = Some(first.clone());
                }
                None => {
                    seen_links.insert(key, entry.name.clone());
                    entry.size = meta.len();
                }
            }
        }
        EntryKind::Regular => entry.size = meta.len(),
        EntryKind::BlockDevice | EntryKind::CharDevice => {
            let (major, minor) = split_device(meta.rdev());
            entry.device_major = major;
            entry.device_minor = minor;
        }
        _ => {}
    }

    Ok(entry)
}

/// Extended attributes of `path` itself, without following symlinks.
fn read_xattrs(path: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut xattrs = BTreeMap::new();
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return Ok(xattrs),
        Err(e) => return Err(Error::io("list xattrs of", path, e)),
    };
    for name in names {
        let Some(key) = name.to_str() else {
            trace!("Skipping non UTF-8 xattr {:?} on {}", name, path.display());
            continue;
        };
        match xattr::get(path, &name) {
            Ok(Some(value)) => {
                xattrs.insert(key.to_string(), value);
            }
            // removed between list and get
            Ok(None) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENODATA) => {}
            Err(e) => return Err(Error::io("read xattr of", path, e)),
        }
    }
    Ok(xattrs)
}

fn walk_error(root: &Path, err: walkdir::Error) -> Error {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
    Error::io("walk", path, source)
}

/// Reads exactly `len` bytes from a file that may change while it is packed.
///
/// Extra bytes are cut off and a short file is an error, so the body always
/// matches the size already written into the header.
struct SizedReader<R> {
    inner: R,
    remaining: u64,
    path: PathBuf,
}

impl<R: Read> SizedReader<R> {
    fn new(inner: R, len: u64, path: &Path) -> Self {
        Self {
            inner,
            remaining: len,
            path: path.to_path_buf(),
        }
    }
}

impl<R: Read> Read for SizedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while packing", self.path.display()),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
