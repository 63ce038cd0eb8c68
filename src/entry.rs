//! Typed view of a single tar record.
//!
//! [`TarEntry`] is what the unpacker dispatches on and what filters inspect
//! and produce. It is decoded from a `tar::Entry` with [`TarEntry::from_entry`]
//! and written back with [`TarEntry::append_to`], which always emits a GNU
//! header (long names through GNU long-name records) preceded by a PAX record
//! when the entry carries xattrs.
//!
//! This module also owns the whiteout naming convention:
//!
//! - `.wh.<name>`: the sibling `<name>` was deleted in this layer
//! - `.wh..wh..opq`: the containing directory is opaque
//! - `.wh..wh.plnk`: reserved hardlink bookkeeping directory

use crate::error::{Error, Result};
use log::trace;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use tar_rs as tar;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";
pub const WHITEOUT_OPAQUE_DIR: &str = ".wh..wh..opq";
pub const WHITEOUT_LINK_DIR: &str = ".wh..wh.plnk";

const PAX_XATTR_PREFIX: &str = "SCHILY.xattr.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Directory,
    Regular,
    Symlink,
    HardLink,
    BlockDevice,
    CharDevice,
    Fifo,
}

impl EntryKind {
    pub fn from_tar(entry_type: tar::EntryType) -> Option<Self> {
        match entry_type {
            tar::EntryType::Directory => Some(EntryKind::Directory),
            tar::EntryType::Regular | tar::EntryType::Continuous => Some(EntryKind::Regular),
            tar::EntryType::Symlink => Some(EntryKind::Symlink),
            tar::EntryType::Link => Some(EntryKind::HardLink),
            tar::EntryType::Block => Some(EntryKind::BlockDevice),
            tar::EntryType::Char => Some(EntryKind::CharDevice),
            tar::EntryType::Fifo => Some(EntryKind::Fifo),
            _ => None,
        }
    }

    pub fn to_tar(self) -> tar::EntryType {
        match self {
            EntryKind::Directory => tar::EntryType::Directory,
            EntryKind::Regular => tar::EntryType::Regular,
            EntryKind::Symlink => tar::EntryType::Symlink,
            EntryKind::HardLink => tar::EntryType::Link,
            EntryKind::BlockDevice => tar::EntryType::Block,
            EntryKind::CharDevice => tar::EntryType::Char,
            EntryKind::Fifo => tar::EntryType::Fifo,
        }
    }

    pub fn is_device(self) -> bool {
        matches!(self, EntryKind::BlockDevice | EntryKind::CharDevice)
    }

    /// Block and char devices and fifos.
    pub fn is_special(self) -> bool {
        matches!(
            self,
            EntryKind::BlockDevice | EntryKind::CharDevice | EntryKind::Fifo
        )
    }

    pub fn is_link(self) -> bool {
        matches!(self, EntryKind::Symlink | EntryKind::HardLink)
    }
}

/// One archive record, minus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntry {
    /// Relative, slash-separated archive name.
    pub name: PathBuf,
    pub kind: EntryKind,
    /// Body length; only regular files carry one.
    pub size: u64,
    /// Permission bits, masked to `0o7777`.
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    /// Symlink target verbatim, or the archive name a hardlink points at.
    pub link_target: Option<PathBuf>,
    /// Seconds since the epoch.
    pub mtime: u64,
    /// Seconds since the epoch, when the record carries one.
    pub atime: Option<u64>,
    pub device_major: u32,
    pub device_minor: u32,
    /// Extended attributes from `SCHILY.xattr.*` PAX records.
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl TarEntry {
    pub fn new(name: impl Into<PathBuf>, kind: EntryKind) -> Self {
        let mode = match kind {
            EntryKind::Directory => 0o755,
            EntryKind::Symlink => 0o777,
            _ => 0o644,
        };
        Self {
            name: name.into(),
            kind,
            size: 0,
            mode,
            uid: 0,
            gid: 0,
            link_target: None,
            mtime: 0,
            atime: None,
            device_major: 0,
            device_minor: 0,
            xattrs: BTreeMap::new(),
        }
    }

    /// Decode the header of `entry`, including its PAX extensions.
    ///
    /// The body is left unread.
    pub fn from_entry<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Self> {
        let mut xattrs = BTreeMap::new();
        let mut pax_mtime = None;
        let mut pax_atime = None;

        let extensions = entry
            .pax_extensions()
            .map_err(|e| Error::from_stream("reading PAX extensions", e))?;
        if let Some(extensions) = extensions {
            for ext in extensions {
                let ext = ext.map_err(|e| Error::from_stream("reading PAX record", e))?;
                let key = match ext.key() {
                    Ok(key) => key,
                    Err(e) => {
                        trace!("Skipping PAX key decode error: {}", e);
                        continue;
                    }
                };
                if let Some(attr) = key.strip_prefix(PAX_XATTR_PREFIX) {
                    xattrs.insert(attr.to_string(), ext.value_bytes().to_vec());
                } else if key == "mtime" {
                    pax_mtime = parse_pax_seconds(ext.value_bytes());
                } else if key == "atime" {
                    pax_atime = parse_pax_seconds(ext.value_bytes());
                }
            }
        }

        let name = entry
            .path()
            .map_err(|e| Error::from_stream("reading entry path", e))?
            .into_owned();
        let display_name = name.display().to_string();

        let header = entry.header();
        let entry_type = header.entry_type();
        let kind = EntryKind::from_tar(entry_type).ok_or_else(|| Error::UnsupportedEntryType {
            name: display_name.clone(),
            kind: format!("{:?}", entry_type),
        })?;

        let field = |what: &str, res: std::io::Result<u64>| {
            res.map_err(|e| Error::ReadCorruption {
                context: format!("bad {} field for {:?}", what, display_name),
                source: Some(e),
            })
        };
        let mode = header
            .mode()
            .map_err(|e| Error::ReadCorruption {
                context: format!("bad mode field for {:?}", display_name),
                source: Some(e),
            })?
            & 0o7777;
        let uid = field("uid", header.uid())?;
        let gid = field("gid", header.gid())?;
        let mtime = match pax_mtime {
            Some(mtime) => mtime,
            None => field("mtime", header.mtime())?,
        };
        let atime = pax_atime.or_else(|| {
            header
                .as_gnu()
                .and_then(|gnu| gnu.atime().ok())
                .filter(|atime| *atime != 0)
        });

        let (device_major, device_minor) = if kind.is_device() {
            let major = header
                .device_major()
                .map_err(|e| Error::ReadCorruption {
                    context: format!("bad device major for {:?}", display_name),
                    source: Some(e),
                })?
                .unwrap_or(0);
            let minor = header
                .device_minor()
                .map_err(|e| Error::ReadCorruption {
                    context: format!("bad device minor for {:?}", display_name),
                    source: Some(e),
                })?
                .unwrap_or(0);
            (major, minor)
        } else {
            (0, 0)
        };

        let link_target = if kind.is_link() {
            let target = entry
                .link_name()
                .map_err(|e| Error::from_stream("reading link name", e))?
                .map(|p| p.into_owned())
                .ok_or_else(|| Error::corrupt(format!("link without target: {:?}", display_name)))?;
            Some(target)
        } else {
            None
        };

        let size = if kind == EntryKind::Regular {
            entry.size()
        } else {
            0
        };

        Ok(Self {
            name,
            kind,
            size,
            mode,
            uid,
            gid,
            link_target,
            mtime,
            atime,
            device_major,
            device_minor,
            xattrs,
        })
    }

    /// Build the GNU header for this entry. Path and link name are set by the builder.
    pub fn to_header(&self) -> Result<tar::Header> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(self.kind.to_tar());
        header.set_mode(self.mode & 0o7777);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header.set_mtime(self.mtime);
        header.set_size(if self.kind == EntryKind::Regular {
            self.size
        } else {
            0
        });
        if let (Some(atime), Some(gnu)) = (self.atime, header.as_gnu_mut()) {
            gnu.set_atime(atime);
        }
        if self.kind.is_device() {
            header
                .set_device_major(self.device_major)
                .map_err(|e| Error::io("encode device of", &self.name, e))?;
            header
                .set_device_minor(self.device_minor)
                .map_err(|e| Error::io("encode device of", &self.name, e))?;
        }
        Ok(header)
    }

    /// Append this entry to `builder`, taking the body from `body`.
    ///
    /// `body` must yield exactly `size` bytes for regular files and is ignored otherwise.
    pub fn append_to<W: Write, R: Read>(
        &self,
        builder: &mut tar::Builder<W>,
        body: R,
    ) -> Result<()> {
        let mut header = self.to_header()?;

        if !self.xattrs.is_empty() {
            let records: Vec<(String, &[u8])> = self
                .xattrs
                .iter()
                .map(|(k, v)| (format!("{}{}", PAX_XATTR_PREFIX, k), v.as_slice()))
                .collect();
            builder
                .append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), *v)))
                .map_err(|e| Error::from_append(&self.name, e))?;
        }

        let res = match (&self.kind, &self.link_target) {
            (EntryKind::Symlink | EntryKind::HardLink, Some(target)) => {
                builder.append_link(&mut header, &self.name, target)
            }
            (EntryKind::Symlink | EntryKind::HardLink, None) => {
                return Err(Error::FilterError {
                    name: self.name.display().to_string(),
                    reason: "link entry without a target".to_string(),
                })
            }
            (EntryKind::Regular, _) => builder.append_data(&mut header, &self.name, body),
            _ => builder.append_data(&mut header, &self.name, std::io::empty()),
        };
        res.map_err(|e| Error::from_append(&self.name, e))
    }
}

fn parse_pax_seconds(value: &[u8]) -> Option<u64> {
    let value = std::str::from_utf8(value).ok()?;
    let secs = value.split('.').next()?;
    secs.parse().ok()
}

/// How an archive name participates in whiteout handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Whiteout {
    /// `.wh.<name>`: remove the sibling path carried here.
    Remove(PathBuf),
    /// `.wh..wh..opq`: the directory carried here is opaque.
    Opaque(PathBuf),
    /// `.wh..wh.plnk`, anything under it, or another `.wh..wh.` name.
    Reserved,
    /// `.wh.` followed by nothing, `.` or `..`.
    Malformed,
}

/// Classify a normalized archive name. Returns `None` for ordinary entries.
pub fn classify_whiteout(name: &Path) -> Option<Whiteout> {
    let under_link_dir = name
        .components()
        .any(|c| matches!(c, Component::Normal(n) if n == OsStr::new(WHITEOUT_LINK_DIR)));
    if under_link_dir {
        return Some(Whiteout::Reserved);
    }

    let base = name.file_name()?.as_bytes();
    let parent = name.parent().unwrap_or_else(|| Path::new(""));

    if base == WHITEOUT_OPAQUE_DIR.as_bytes() {
        return Some(Whiteout::Opaque(parent.to_path_buf()));
    }
    if base.starts_with(WHITEOUT_META_PREFIX.as_bytes()) {
        return Some(Whiteout::Reserved);
    }

    let target = base.strip_prefix(WHITEOUT_PREFIX.as_bytes())?;
    match target {
        b"" | b"." | b".." => Some(Whiteout::Malformed),
        _ => Some(Whiteout::Remove(parent.join(OsStr::from_bytes(target)))),
    }
}

/// The `.wh.<name>` marker that deletes `target`.
pub fn whiteout_path(target: &Path) -> Option<PathBuf> {
    let base = target.file_name()?;
    let mut marker = Vec::with_capacity(WHITEOUT_PREFIX.len() + base.len());
    marker.extend_from_slice(WHITEOUT_PREFIX.as_bytes());
    marker.extend_from_slice(base.as_bytes());
    let parent = target.parent().unwrap_or_else(|| Path::new(""));
    Some(parent.join(OsStr::from_bytes(&marker)))
}

/// The `.wh..wh..opq` marker inside `dir`.
pub fn opaque_marker_path(dir: &Path) -> PathBuf {
    dir.join(WHITEOUT_OPAQUE_DIR)
}
