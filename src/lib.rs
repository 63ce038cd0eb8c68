pub mod cancel;
pub mod entry;
pub mod error;
pub mod filter;
pub mod packer;
pub mod pipe;
pub mod platform;
pub mod time_util;
pub mod unpacker;

// Re-exports for easy access
pub use cancel::Cancellation;
pub use entry::{EntryKind, TarEntry};
pub use error::{Error, Result};
pub use filter::{
    apply_filter, new_overlay_whiteout_filter, EntryFilter, FilterAction, FilterStream,
    GenericToOverlay, OverlayWhiteouts,
};
pub use packer::{pack, PackStream};
pub use platform::{Platform, UnixPlatform};
pub use unpacker::{unpack, UnpackOptions, UnpackSummary};
