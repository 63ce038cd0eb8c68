//! Streaming tar-to-tar transforms.
//!
//! [`apply_filter`] reads one entry at a time, asks an [`EntryFilter`] what to
//! do with it and writes the result through a bounded pipe. Stages compose:
//! the output of one filter is a valid input for another filter or for
//! [`crate::unpack`].
//!
//! Two filters translate between the overlayfs on-disk whiteout convention
//! and the generic marker files:
//!
//! - [`OverlayWhiteouts`]: char device 0/0 and the `overlay.opaque` xattr to
//!   `.wh.` markers
//! - [`GenericToOverlay`]: the reverse

use crate::entry::{
    classify_whiteout, opaque_marker_path, whiteout_path, EntryKind, TarEntry, Whiteout,
};
use crate::error::{Error, Result};
use crate::pipe::{self, PipeReader, PipeWriter};
use log::{debug, trace};
use std::io::{self, BufWriter, Read};
use std::path::PathBuf;
use tar_rs as tar;

pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
/// Opaque xattr written by rootless overlay mounts (`userxattr`).
pub const OVERLAY_USER_OPAQUE_XATTR: &str = "user.overlay.opaque";

/// Decision for a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Copy the entry unchanged.
    Keep,
    /// Leave the entry out, body included.
    Drop,
    /// Emit these entries instead.
    ///
    /// The first one carries the original body when its size matches the
    /// original's; every other replacement must be empty.
    Replace(Vec<TarEntry>),
}

pub trait EntryFilter: Send {
    fn filter(&mut self, entry: &TarEntry) -> Result<FilterAction>;
}

impl<F> EntryFilter for F
where
    F: FnMut(&TarEntry) -> Result<FilterAction> + Send,
{
    fn filter(&mut self, entry: &TarEntry) -> Result<FilterAction> {
        self(entry)
    }
}

/// Filtered tar bytes produced by [`apply_filter`].
pub struct FilterStream {
    reader: PipeReader,
}

impl Read for FilterStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Run `filter` over the tar stream in `reader` on a separate thread.
///
/// Errors from the input or the filter close the output with that error.
pub fn apply_filter<R, F>(reader: R, filter: F) -> Result<FilterStream>
where
    R: Read + Send + 'static,
    F: EntryFilter + 'static,
{
    let reader = pipe::spawn_tar_producer("layertar-filter", move |builder| {
        filter_tar(reader, filter, builder)
    })?;
    Ok(FilterStream { reader })
}

fn filter_tar<R: Read, F: EntryFilter>(
    src: R,
    mut filter: F,
    dest: &mut tar::Builder<BufWriter<PipeWriter>>,
) -> Result<()> {
    let mut src = tar::Archive::new(src);
    let (mut kept, mut dropped, mut replaced) = (0usize, 0usize, 0usize);

    {
        let entries = src
            .entries()
            .map_err(|e| Error::from_stream("reading archive", e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| Error::from_stream("reading entry header", e))?;
            let parsed = TarEntry::from_entry(&mut entry)?;

            match filter.filter(&parsed)? {
                FilterAction::Keep => {
                    copy_entry(&mut entry, &parsed, dest)?;
                    kept += 1;
                }
                FilterAction::Drop => {
                    trace!("Dropping {}", parsed.name.display());
                    dropped += 1;
                }
                FilterAction::Replace(replacements) => {
                    trace!(
                        "Replacing {} with {} entries",
                        parsed.name.display(),
                        replacements.len()
                    );
                    write_replacements(&mut entry, &parsed, &replacements, dest)?;
                    replaced += 1;
                }
            }
        }
    }

    io::copy(&mut src.into_inner(), &mut io::sink())
        .map_err(|e| Error::from_stream("reading archive trailer", e))?;

    debug!(
        "Filter done: {} kept, {} dropped, {} replaced",
        kept, dropped, replaced
    );
    Ok(())
}

/// Copy an entry with its original header and PAX records.
fn copy_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    parsed: &TarEntry,
    dest: &mut tar::Builder<BufWriter<PipeWriter>>,
) -> Result<()> {
    let mut header = entry.header().clone();

    let extensions = entry
        .pax_extensions()
        .map_err(|e| Error::from_stream("reading PAX extensions", e))?;
    if let Some(extensions) = extensions {
        let mut records = Vec::new();
        for ext in extensions {
            let ext = ext.map_err(|e| Error::from_stream("reading PAX record", e))?;
            let key = ext.key().map_err(|e| Error::ReadCorruption {
                context: format!("PAX key of {}: {}", parsed.name.display(), e),
                source: None,
            })?;
            // the builder writes these again
            if key == "path" || key == "linkpath" {
                continue;
            }
            records.push((key.to_string(), ext.value_bytes().to_vec()));
        }
        if !records.is_empty() {
            dest.append_pax_extensions(records.iter().map(|(k, v)| (k.as_str(), v.as_slice())))
                .map_err(|e| Error::from_append(&parsed.name, e))?;
        }
    }

    let res = match (&parsed.link_target, parsed.kind.is_link()) {
        (Some(target), true) => dest.append_link(&mut header, &parsed.name, target),
        _ => dest.append_data(&mut header, &parsed.name, entry),
    };
    res.map_err(|e| Error::from_append(&parsed.name, e))
}

fn write_replacements<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    original: &TarEntry,
    replacements: &[TarEntry],
    dest: &mut tar::Builder<BufWriter<PipeWriter>>,
) -> Result<()> {
    for (i, replacement) in replacements.iter().enumerate() {
        let carries_body = replacement.kind == EntryKind::Regular && replacement.size > 0;
        if i == 0 && carries_body && replacement.size == original.size {
            replacement.append_to(dest, &mut *entry)?;
        } else if carries_body {
            return Err(Error::FilterError {
                name: original.name.display().to_string(),
                reason: format!(
                    "replacement {} has size {} but no body to take it from",
                    replacement.name.display(),
                    replacement.size
                ),
            });
        } else {
            replacement.append_to(dest, io::empty())?;
        }
    }
    Ok(())
}

/// An entry of `kind` at `name` with the ownership and times of `like`.
fn derived_entry(like: &TarEntry, name: PathBuf, kind: EntryKind) -> TarEntry {
    let mut entry = TarEntry::new(name, kind);
    entry.uid = like.uid;
    entry.gid = like.gid;
    entry.mtime = like.mtime;
    entry.atime = like.atime;
    entry
}

fn is_opaque_dir(entry: &TarEntry) -> bool {
    entry.kind == EntryKind::Directory
        && [OVERLAY_OPAQUE_XATTR, OVERLAY_USER_OPAQUE_XATTR]
            .iter()
            .any(|key| entry.xattrs.get(*key).map(Vec::as_slice) == Some(b"y".as_slice()))
}

/// Converts overlayfs whiteouts into generic marker files.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverlayWhiteouts;

pub fn new_overlay_whiteout_filter() -> OverlayWhiteouts {
    OverlayWhiteouts
}

impl EntryFilter for OverlayWhiteouts {
    fn filter(&mut self, entry: &TarEntry) -> Result<FilterAction> {
        if entry.kind == EntryKind::CharDevice && entry.device_major == 0 && entry.device_minor == 0
        {
            let name = whiteout_path(&entry.name).ok_or_else(|| Error::FilterError {
                name: entry.name.display().to_string(),
                reason: "whiteout device without a file name".to_string(),
            })?;
            let mut marker = derived_entry(entry, name, EntryKind::Regular);
            marker.mode = entry.mode;
            return Ok(FilterAction::Replace(vec![marker]));
        }

        if is_opaque_dir(entry) {
            let mut dir = entry.clone();
            dir.xattrs.remove(OVERLAY_OPAQUE_XATTR);
            dir.xattrs.remove(OVERLAY_USER_OPAQUE_XATTR);
            let marker = derived_entry(entry, opaque_marker_path(&entry.name), EntryKind::Regular);
            return Ok(FilterAction::Replace(vec![dir, marker]));
        }

        Ok(FilterAction::Keep)
    }
}

/// Converts generic marker files into overlayfs whiteouts.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericToOverlay;

impl EntryFilter for GenericToOverlay {
    fn filter(&mut self, entry: &TarEntry) -> Result<FilterAction> {
        match classify_whiteout(&entry.name) {
            None => Ok(FilterAction::Keep),
            Some(Whiteout::Reserved) => Ok(FilterAction::Drop),
            Some(Whiteout::Malformed) => Err(Error::FilterError {
                name: entry.name.display().to_string(),
                reason: "whiteout marker without a target".to_string(),
            }),
            Some(Whiteout::Remove(target)) => {
                let mut device = derived_entry(entry, target, EntryKind::CharDevice);
                device.mode = entry.mode;
                Ok(FilterAction::Replace(vec![device]))
            }
            Some(Whiteout::Opaque(dir)) => {
                let dir = if dir.as_os_str().is_empty() {
                    PathBuf::from(".")
                } else {
                    dir
                };
                let mut opaque = derived_entry(entry, dir, EntryKind::Directory);
                opaque
                    .xattrs
                    .insert(OVERLAY_OPAQUE_XATTR.to_string(), b"y".to_vec());
                Ok(FilterAction::Replace(vec![opaque]))
            }
        }
    }
}
