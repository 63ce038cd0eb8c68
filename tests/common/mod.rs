//! Common utilities for integration tests

#![allow(dead_code)]

use anyhow::Result;
use filetime::FileTime;
use layertar::{EntryKind, TarEntry};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tar_rs as tar;
use walkdir::WalkDir;

/// Random lowercase word, as used for generated file names.
pub fn generate_word(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(b'a' + rng.random_range(0..26u8)))
        .collect()
}

/// Populate `dir` with `num` random files, each with a `.symlink` symlink and
/// a `.lnk` hardlink next to it. Returns the created names.
pub fn generate_files(dir: &Path, num: usize, max_len: usize) -> Result<Vec<String>> {
    let mut rng = rand::rng();
    let mut names = Vec::new();

    for _ in 0..num {
        let name = generate_word(15);
        let path = dir.join(&name);

        let mut content = vec![0u8; rng.random_range(0..max_len)];
        rng.fill(&mut content[..]);
        fs::write(&path, &content)?;

        symlink(&name, dir.join(format!("{name}.symlink")))?;
        fs::hard_link(&path, dir.join(format!("{name}.lnk")))?;

        names.push(name.clone());
        names.push(format!("{name}.symlink"));
        names.push(format!("{name}.lnk"));
    }

    Ok(names)
}

/// Check every generated name came back with the right shape, and nothing else did.
pub fn verify_generated(unpack_dir: &Path, names: &[String]) -> Result<()> {
    let mut count = 0;
    for item in WalkDir::new(unpack_dir).min_depth(1) {
        let item = item?;
        count += 1;
        let base = item.file_name().to_string_lossy().into_owned();
        assert!(names.contains(&base), "unexpected file {base:?}");

        let path = item.path();
        if let Some(target) = base.strip_suffix(".symlink") {
            let meta = fs::symlink_metadata(path)?;
            assert!(meta.file_type().is_symlink(), "{base:?} is not a symlink");
            assert_eq!(fs::read_link(path)?, PathBuf::from(target));
            assert_eq!(fs::canonicalize(path)?, fs::canonicalize(unpack_dir.join(target))?);
        } else if let Some(target) = base.strip_suffix(".lnk") {
            let link = fs::symlink_metadata(path)?;
            let pristine = fs::symlink_metadata(unpack_dir.join(target))?;
            assert_eq!(link.ino(), pristine.ino(), "{base:?} is not a hard link to {target:?}");
        }
    }
    assert_eq!(count, names.len(), "walked {count}/{} files", names.len());
    Ok(())
}

/// Kind and content of every path under `dir`, for comparing two trees.
pub fn snapshot(dir: &Path) -> Result<BTreeMap<PathBuf, String>> {
    let mut out = BTreeMap::new();
    for item in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let item = item?;
        let rel = item.path().strip_prefix(dir)?.to_path_buf();
        let meta = fs::symlink_metadata(item.path())?;
        let file_type = meta.file_type();
        let desc = if file_type.is_dir() {
            "dir".to_string()
        } else if file_type.is_symlink() {
            format!("symlink -> {}", fs::read_link(item.path())?.display())
        } else if file_type.is_fifo() {
            "fifo".to_string()
        } else {
            format!("file {}", hex::encode(Sha256::digest(fs::read(item.path())?)))
        };
        out.insert(rel, desc);
    }
    Ok(out)
}

/// Set fixed times on everything under `dir`, with atime after mtime so that
/// reads during a pack do not move it on relatime mounts.
pub fn freeze_times(dir: &Path) -> Result<()> {
    let mtime = FileTime::from_unix_time(1_500_000_000, 0);
    let atime = FileTime::now();
    for item in WalkDir::new(dir).contents_first(true) {
        let item = item?;
        if item.path_is_symlink() {
            filetime::set_symlink_file_times(item.path(), atime, mtime)?;
        } else {
            filetime::set_file_times(item.path(), atime, mtime)?;
        }
    }
    Ok(())
}

/// Reader that hashes everything passing through it.
pub struct DigestReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn digest(self) -> String {
        format!("sha256:{}", hex::encode(self.hasher.finalize()))
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Regular file entry with a body.
pub fn file_entry(name: &str, content: &[u8]) -> TarEntry {
    let mut entry = TarEntry::new(name, EntryKind::Regular);
    entry.size = content.len() as u64;
    entry.uid = current_uid();
    entry.gid = current_gid();
    entry.mtime = 1_600_000_000;
    entry
}

pub fn dir_entry(name: &str) -> TarEntry {
    let mut entry = TarEntry::new(name, EntryKind::Directory);
    entry.uid = current_uid();
    entry.gid = current_gid();
    entry.mtime = 1_600_000_000;
    entry
}

pub fn link_entry(name: &str, kind: EntryKind, target: &str) -> TarEntry {
    let mut entry = TarEntry::new(name, kind);
    entry.link_target = Some(PathBuf::from(target));
    entry.uid = current_uid();
    entry.gid = current_gid();
    entry.mtime = 1_600_000_000;
    entry
}

/// Build an in-memory layer from entries and bodies.
pub fn build_layer(entries: &[(TarEntry, &[u8])]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (entry, body) in entries {
        entry.append_to(&mut builder, *body)?;
    }
    Ok(builder.into_inner()?)
}

/// Append a header whose name and link name are copied verbatim, bypassing
/// the builder's path checks. Used to craft hostile archives.
pub fn append_raw(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    entry_type: tar::EntryType,
    link_name: Option<&str>,
    body: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    {
        let gnu = header
            .as_gnu_mut()
            .ok_or_else(|| anyhow::anyhow!("not a GNU header"))?;
        gnu.name[..name.len()].copy_from_slice(name.as_bytes());
        if let Some(link) = link_name {
            gnu.linkname[..link.len()].copy_from_slice(link.as_bytes());
        }
    }
    header.set_entry_type(entry_type);
    header.set_mode(if entry_type == tar::EntryType::Directory {
        0o755
    } else {
        0o644
    });
    header.set_uid(current_uid());
    header.set_gid(current_gid());
    header.set_mtime(1_600_000_000);
    header.set_size(body.len() as u64);
    header.set_cksum();
    builder.append(&header, body)?;
    Ok(())
}

/// Names of all entries in a tar stream, in order.
pub fn entry_names<R: Read>(reader: R) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(reader);
    let mut names = Vec::new();
    for entry in archive.entries()? {
        names.push(entry?.path()?.into_owned());
    }
    Ok(names)
}

/// All entries in a tar stream, decoded.
pub fn read_entries<R: Read>(reader: R) -> Result<Vec<TarEntry>> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        entries.push(TarEntry::from_entry(&mut entry?)?);
    }
    Ok(entries)
}

pub fn current_uid() -> u64 {
    u64::from(unsafe { libc::geteuid() })
}

pub fn current_gid() -> u64 {
    u64::from(unsafe { libc::getegid() })
}

pub fn is_root() -> bool {
    current_uid() == 0
}
