mod common;

use anyhow::Result;
use common::{
    build_layer, dir_entry, file_entry, freeze_times, generate_files, is_root, snapshot,
    verify_generated, DigestReader,
};
use filetime::FileTime;
use layertar::pipe::pipe;
use layertar::{pack, unpack, Cancellation, EntryKind, Error, TarEntry, UnpackOptions};
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt, PermissionsExt};
use std::thread;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::tempdir;

#[test]
fn test_pack_unpack() -> Result<()> {
    let pack_dir = tempdir()?;
    let files = generate_files(pack_dir.path(), 10, 100_000)?;
    let unpack_dir = tempdir()?;

    let stream = pack(&Cancellation::new(), pack_dir.path())?;

    // Digest the bytes as they leave the packer and as they enter the unpacker.
    let (pipe_reader, mut pipe_writer) = pipe();
    let closer = pipe_writer.closer();
    let producer = thread::spawn(move || {
        let mut tee = DigestReader::new(stream);
        if let Err(e) = io::copy(&mut tee, &mut pipe_writer) {
            closer.close_with_error(e);
        }
        tee.digest()
    });

    let mut consumer = DigestReader::new(pipe_reader);
    let summary = unpack(
        &Cancellation::new(),
        &mut consumer,
        unpack_dir.path(),
        UnpackOptions::new(),
    )?;

    let packed = producer.join().expect("producer thread panicked");
    assert_eq!(packed, consumer.digest(), "digest from pack did not match digest from unpack");
    assert_eq!(summary.entries, files.len());

    verify_generated(unpack_dir.path(), &files)?;
    assert_eq!(snapshot(pack_dir.path())?, snapshot(unpack_dir.path())?);
    Ok(())
}

#[test]
fn test_pack_is_deterministic() -> Result<()> {
    let pack_dir = tempdir()?;
    generate_files(pack_dir.path(), 8, 20_000)?;
    fs::create_dir(pack_dir.path().join("nested"))?;
    fs::write(pack_dir.path().join("nested/inner"), b"inner")?;
    freeze_times(pack_dir.path())?;

    let mut first = Vec::new();
    pack(&Cancellation::new(), pack_dir.path())?.read_to_end(&mut first)?;
    let mut second = Vec::new();
    pack(&Cancellation::new(), pack_dir.path())?.read_to_end(&mut second)?;

    assert_eq!(first.len() % 512, 0);
    assert!(first == second, "two packs of the same tree differ");
    Ok(())
}

#[test]
fn test_cancelled_pack_surfaces_in_unpack() -> Result<()> {
    let pack_dir = tempdir()?;
    // Enough data that the producer has to block on the pipe.
    for i in 0..64 {
        fs::write(pack_dir.path().join(format!("file{i:02}")), vec![0xa5u8; 64 * 1024])?;
    }
    let unpack_dir = tempdir()?;

    let cancel = Cancellation::new();
    let stream = pack(&cancel, pack_dir.path())?;
    cancel.cancel();

    let err = unpack(
        &Cancellation::new(),
        stream,
        unpack_dir.path(),
        UnpackOptions::new(),
    )
    .unwrap_err();
    assert!(err.is_cancelled(), "unexpected error: {err}");
    Ok(())
}

#[test]
fn test_cancelled_pack_stream_read_error() -> Result<()> {
    let pack_dir = tempdir()?;
    fs::write(pack_dir.path().join("file"), b"data")?;

    let cancel = Cancellation::new();
    cancel.cancel();
    let mut stream = pack(&cancel, pack_dir.path())?;

    let err = stream.read_to_end(&mut Vec::new()).unwrap_err();
    assert!(Error::from_stream("reading pack", err).is_cancelled());
    Ok(())
}

#[test]
fn test_cancelled_unpack() -> Result<()> {
    let layer = build_layer(&[(file_entry("a", b"a"), b"a")])?;
    let unpack_dir = tempdir()?;

    let cancel = Cancellation::new();
    cancel.cancel();
    let err = unpack(&cancel, &layer[..], unpack_dir.path(), UnpackOptions::new()).unwrap_err();
    assert!(err.is_cancelled());
    assert!(!unpack_dir.path().join("a").exists());
    Ok(())
}

#[test]
fn test_directory_times_survive_child_writes() -> Result<()> {
    let layer = build_layer(&[
        (dir_entry("dir"), b""),
        (dir_entry("dir/sub"), b""),
        (file_entry("dir/sub/file", b"content"), b"content"),
        (file_entry("dir/other", b"x"), b"x"),
    ])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let expected = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    for dir in ["dir", "dir/sub"] {
        let meta = fs::metadata(unpack_dir.path().join(dir))?;
        assert_eq!(meta.modified()?, expected, "mtime of {dir}");
        assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
    }
    Ok(())
}

#[test]
fn test_restrictive_directory_mode_applied_last() -> Result<()> {
    let mut locked = dir_entry("locked");
    locked.mode = 0o555;
    let layer = build_layer(&[
        (locked, b""),
        (file_entry("locked/file", b"data"), b"data"),
    ])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let dir = unpack_dir.path().join("locked");
    assert_eq!(fs::read(dir.join("file"))?, b"data");
    assert_eq!(fs::metadata(&dir)?.permissions().mode() & 0o7777, 0o555);

    // let the tempdir clean up
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[test]
fn test_symlink_times_set_without_following() -> Result<()> {
    let pack_dir = tempdir()?;
    fs::write(pack_dir.path().join("target"), b"target")?;
    symlink("target", pack_dir.path().join("link"))?;

    let target_time = FileTime::from_unix_time(1_400_000_000, 0);
    let link_time = FileTime::from_unix_time(1_300_000_000, 0);
    filetime::set_file_times(pack_dir.path().join("target"), target_time, target_time)?;
    filetime::set_symlink_file_times(pack_dir.path().join("link"), link_time, link_time)?;

    let unpack_dir = tempdir()?;
    let stream = pack(&Cancellation::new(), pack_dir.path())?;
    unpack(&Cancellation::new(), stream, unpack_dir.path(), UnpackOptions::new())?;

    let link_meta = fs::symlink_metadata(unpack_dir.path().join("link"))?;
    assert!(link_meta.file_type().is_symlink());
    assert_eq!(FileTime::from_last_modification_time(&link_meta), link_time);

    let target_meta = fs::metadata(unpack_dir.path().join("target"))?;
    assert_eq!(FileTime::from_last_modification_time(&target_meta), target_time);
    Ok(())
}

#[test]
fn test_out_of_range_mtime_clamped_to_epoch() -> Result<()> {
    let mut entry = file_entry("future", b"x");
    entry.mtime = 20_000_000_000_000;
    let layer = build_layer(&[(entry, b"x")])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let meta = fs::metadata(unpack_dir.path().join("future"))?;
    assert_eq!(meta.modified()?, UNIX_EPOCH);
    Ok(())
}

#[test]
fn test_atime_never_before_mtime() -> Result<()> {
    let mut entry = file_entry("f", b"x");
    entry.mtime = 1_600_000_000;
    entry.atime = Some(1_000);
    let layer = build_layer(&[(entry, b"x")])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let meta = fs::metadata(unpack_dir.path().join("f"))?;
    assert_eq!(meta.atime(), 1_600_000_000);
    assert_eq!(meta.mtime(), 1_600_000_000);
    Ok(())
}

#[test]
fn test_fifo_round_trip() -> Result<()> {
    let layer = build_layer(&[(
        {
            let mut fifo = TarEntry::new("pipe", EntryKind::Fifo);
            fifo.mode = 0o640;
            fifo.mtime = 1_600_000_000;
            fifo.uid = common::current_uid();
            fifo.gid = common::current_gid();
            fifo
        },
        b"",
    )])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let meta = fs::symlink_metadata(unpack_dir.path().join("pipe"))?;
    assert!(meta.file_type().is_fifo());
    assert_eq!(meta.permissions().mode() & 0o7777, 0o640);
    assert_eq!(meta.mtime(), 1_600_000_000);

    // and back through the packer
    let stream = pack(&Cancellation::new(), unpack_dir.path())?;
    let entries = common::read_entries(stream)?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::Fifo);
    Ok(())
}

#[test]
fn test_user_xattrs_round_trip() -> Result<()> {
    let pack_dir = tempdir()?;
    let file = pack_dir.path().join("tagged");
    fs::write(&file, b"body")?;
    if let Err(e) = xattr::set(&file, "user.layertar.tag", b"blue") {
        eprintln!("skipping: user xattrs unavailable: {e}");
        return Ok(());
    }

    let stream = pack(&Cancellation::new(), pack_dir.path())?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), stream, unpack_dir.path(), UnpackOptions::new())?;

    let value = xattr::get(unpack_dir.path().join("tagged"), "user.layertar.tag")?;
    assert_eq!(value.as_deref(), Some(b"blue".as_slice()));
    Ok(())
}

#[test]
fn test_unreadable_file_gets_mode_and_times() -> Result<()> {
    let mut shadow = file_entry("etc/shadow", b"root:*:");
    shadow.mode = 0o000;
    let layer = build_layer(&[
        (dir_entry("etc"), b""),
        (shadow, b"root:*:"),
    ])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let meta = fs::symlink_metadata(unpack_dir.path().join("etc/shadow"))?;
    assert!(meta.is_file());
    assert_eq!(meta.len(), 7);
    assert_eq!(meta.permissions().mode() & 0o7777, 0);
    assert_eq!(meta.mtime(), 1_600_000_000);
    Ok(())
}

#[test]
fn test_unpack_twice() -> Result<()> {
    let pack_dir = tempdir()?;
    let files = generate_files(pack_dir.path(), 5, 10_000)?;
    fs::create_dir(pack_dir.path().join("dir"))?;
    fs::write(pack_dir.path().join("dir/file"), b"file")?;

    let mut layer = Vec::new();
    pack(&Cancellation::new(), pack_dir.path())?.read_to_end(&mut layer)?;

    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    assert_eq!(snapshot(pack_dir.path())?, snapshot(unpack_dir.path())?);
    assert_eq!(files.len() + 2, snapshot(unpack_dir.path())?.len());
    Ok(())
}

#[test]
fn test_unpack_from_stream_consumes_trailer() -> Result<()> {
    let pack_dir = tempdir()?;
    fs::write(pack_dir.path().join("only"), b"only")?;

    let mut stream = DigestReader::new(pack(&Cancellation::new(), pack_dir.path())?);
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &mut stream, unpack_dir.path(), UnpackOptions::new())?;

    // nothing left unread
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest)?;
    assert!(rest.is_empty());
    Ok(())
}

#[test]
fn test_include_predicate() -> Result<()> {
    let layer = build_layer(&[
        (dir_entry("keep"), b""),
        (file_entry("keep/a", b"a"), b"a"),
        (dir_entry("skip"), b""),
        (file_entry("skip/b", b"b"), b"b"),
    ])?;
    let unpack_dir = tempdir()?;
    let options = UnpackOptions::new().with_filter(|entry| !entry.name.starts_with("skip"));
    let summary = unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), options)?;

    assert_eq!(summary.entries, 2);
    assert_eq!(summary.skipped, 2);
    assert!(unpack_dir.path().join("keep/a").exists());
    assert!(!unpack_dir.path().join("skip").exists());
    Ok(())
}

#[test]
fn test_ownership_applied_as_root() -> Result<()> {
    if !is_root() {
        eprintln!("Skipping test: changing ownership requires root");
        return Ok(());
    }
    let mut entry = file_entry("owned", b"x");
    entry.uid = 4242;
    entry.gid = 4343;
    let layer = build_layer(&[(entry, b"x")])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let meta = fs::metadata(unpack_dir.path().join("owned"))?;
    assert_eq!((meta.uid(), meta.gid()), (4242, 4343));
    Ok(())
}

#[test]
fn test_foreign_ownership_ignored_when_unprivileged() -> Result<()> {
    if is_root() {
        eprintln!("Skipping test: only meaningful without root");
        return Ok(());
    }
    let mut entry = file_entry("owned", b"x");
    entry.uid = 0;
    entry.gid = 0;
    let layer = build_layer(&[(entry, b"x")])?;
    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;
    assert_eq!(fs::read(unpack_dir.path().join("owned"))?, b"x");
    Ok(())
}

#[test]
fn test_device_nodes_as_root() -> Result<()> {
    if !is_root() {
        eprintln!("Skipping test: creating device nodes requires root");
        return Ok(());
    }
    let mut null = TarEntry::new("dev/null", EntryKind::CharDevice);
    null.device_major = 1;
    null.device_minor = 3;
    null.mode = 0o666;
    let mut loop0 = TarEntry::new("dev/loop0", EntryKind::BlockDevice);
    loop0.device_major = 7;
    loop0.device_minor = 0;
    let layer = build_layer(&[(dir_entry("dev"), b""), (null, b""), (loop0, b"")])?;

    let unpack_dir = tempdir()?;
    unpack(&Cancellation::new(), &layer[..], unpack_dir.path(), UnpackOptions::new())?;

    let null_meta = fs::symlink_metadata(unpack_dir.path().join("dev/null"))?;
    assert!(null_meta.file_type().is_char_device());
    assert_eq!(layertar::platform::split_device(null_meta.rdev()), (1, 3));
    let loop_meta = fs::symlink_metadata(unpack_dir.path().join("dev/loop0"))?;
    assert!(loop_meta.file_type().is_block_device());

    // the packer records the same numbers
    let entries = common::read_entries(pack(&Cancellation::new(), unpack_dir.path())?)?;
    let null_entry = entries
        .iter()
        .find(|e| e.name.ends_with("null"))
        .expect("dev/null packed");
    assert_eq!((null_entry.device_major, null_entry.device_minor), (1, 3));
    Ok(())
}

#[test]
fn test_unpack_rejects_truncated_stream() -> Result<()> {
    let layer = build_layer(&[(file_entry("big", &[7u8; 4096]), &[7u8; 4096])])?;
    let truncated = &layer[..1024];
    let unpack_dir = tempdir()?;
    let err = unpack(&Cancellation::new(), truncated, unpack_dir.path(), UnpackOptions::new())
        .unwrap_err();
    assert!(matches!(err, Error::ReadCorruption { .. }), "unexpected error: {err}");
    Ok(())
}
