//! Timestamp helpers for the time-setting calls.
//!
//! The representable range depends on the width of the platform `timespec`
//! nanosecond field. It is resolved once into [`TIME_BOUNDS`]; callers clamp
//! against that value instead of branching on the platform themselves.

use filetime::{set_symlink_file_times, FileTime};
use once_cell::sync::Lazy;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inclusive range of instants the time-setting calls accept without undefined behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBounds {
    pub min: SystemTime,
    pub max: SystemTime,
}

impl TimeBounds {
    fn detect() -> Self {
        // tv_nsec is a C long
        let max = if std::mem::size_of::<libc::c_long>() == 8 {
            UNIX_EPOCH + Duration::from_nanos(i64::MAX as u64)
        } else {
            UNIX_EPOCH + Duration::from_secs(i32::MAX as u64)
        };
        Self {
            min: UNIX_EPOCH,
            max,
        }
    }

    pub fn contains(&self, t: SystemTime) -> bool {
        t >= self.min && t <= self.max
    }
}

pub static TIME_BOUNDS: Lazy<TimeBounds> = Lazy::new(TimeBounds::detect);

/// Clamp `t` to the epoch when it falls outside [`TIME_BOUNDS`].
pub fn clamp_time(t: SystemTime) -> SystemTime {
    if TIME_BOUNDS.contains(t) {
        t
    } else {
        TIME_BOUNDS.min
    }
}

pub fn latest_time(a: SystemTime, b: SystemTime) -> SystemTime {
    if a > b {
        a
    } else {
        b
    }
}

/// Seconds since the epoch as stored in a tar header.
pub fn unix_time(secs: u64) -> SystemTime {
    UNIX_EPOCH
        .checked_add(Duration::from_secs(secs))
        .unwrap_or(TIME_BOUNDS.min)
}

/// Set access and modification time by path.
///
/// Goes through `utimensat(AT_SYMLINK_NOFOLLOW)`: the file is never opened,
/// so fifos do not block, devices are not touched and mode 000 files work
/// for their owner. A symlink gets its own times, not its target's.
pub fn set_path_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
    set_symlink_file_times(
        path,
        FileTime::from_system_time(clamp_time(atime)),
        FileTime::from_system_time(clamp_time(mtime)),
    )
}

/// Set access and modification time on the symlink itself, not on its target.
pub fn set_symlink_times(path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
    set_path_times(path, atime, mtime)
}
