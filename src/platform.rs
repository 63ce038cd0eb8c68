//! Platform capabilities the unpacker needs beyond `std::fs`.
//!
//! Device-node creation, ownership changes and symlink timestamps are
//! platform specific. They sit behind [`Platform`] so the unpacker never
//! inlines raw mode bits or syscalls, and tests can substitute their own.

use crate::entry::EntryKind;
use crate::time_util;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::SystemTime;

pub trait Platform: Send + Sync {
    /// Create a block device, char device or fifo at `path`.
    fn create_special_file(
        &self,
        path: &Path,
        kind: EntryKind,
        major: u32,
        minor: u32,
        mode: u32,
    ) -> io::Result<()>;

    /// Set both timestamps on a symlink without following it.
    fn set_symlink_times(&self, path: &Path, atime: SystemTime, mtime: SystemTime)
        -> io::Result<()>;

    /// Set both timestamps on any other object without opening it.
    fn set_times(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;

    /// Change ownership without following symlinks.
    fn lchown(&self, path: &Path, uid: u64, gid: u64) -> io::Result<()>;

    /// Whether ownership and device nodes can be applied as recorded.
    fn is_privileged(&self) -> bool;
}

/// [`Platform`] backed by libc on Linux and macOS.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixPlatform;

impl Platform for UnixPlatform {
    fn create_special_file(
        &self,
        path: &Path,
        kind: EntryKind,
        major: u32,
        minor: u32,
        mode: u32,
    ) -> io::Result<()> {
        let file_type = match kind {
            EntryKind::BlockDevice => libc::S_IFBLK,
            EntryKind::CharDevice => libc::S_IFCHR,
            EntryKind::Fifo => libc::S_IFIFO,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{other:?} is not a special file"),
                ))
            }
        };
        let full_mode = file_type | (mode as libc::mode_t & 0o7777);
        let dev = make_device(major, minor);

        let c_path = to_cstring(path)?;
        let res = unsafe { libc::mknod(c_path.as_ptr(), full_mode, dev) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn set_symlink_times(
        &self,
        path: &Path,
        atime: SystemTime,
        mtime: SystemTime,
    ) -> io::Result<()> {
        time_util::set_symlink_times(path, atime, mtime)
    }

    fn set_times(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        time_util::set_path_times(path, atime, mtime)
    }

    fn lchown(&self, path: &Path, uid: u64, gid: u64) -> io::Result<()> {
        let c_path = to_cstring(path)?;
        let res = unsafe { libc::lchown(c_path.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn is_privileged(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn make_device(major: u32, minor: u32) -> libc::dev_t {
    libc::makedev(major as i32, minor as i32)
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn make_device(major: u32, minor: u32) -> libc::dev_t {
    libc::makedev(major as libc::c_uint, minor as libc::c_uint)
}

/// Split a raw `st_rdev` into major and minor numbers.
pub fn split_device(rdev: u64) -> (u32, u32) {
    let dev = rdev as libc::dev_t;
    (libc::major(dev) as u32, libc::minor(dev) as u32)
}

fn to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Path contains interior NUL: {}", path.display()),
        )
    })
}
