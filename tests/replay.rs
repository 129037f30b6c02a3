//! End-to-end replay scenarios: parse a literal log, apply it to a fresh
//! target directory, inspect what the host filesystem ends up holding.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use tempfile::TempDir;
use unplugfs::Controls;
use unplugfs::Error;
use unplugfs::LogReader;
use unplugfs::ReplayError;
use unplugfs::Replayer;
use unplugfs::Summary;
use unplugfs::WritebackPolicy;
use unplugfs::replay_log;

const SMALL_LOG: &str = "(mkdir \"/d\" 493)\n\
                         (create \"/d/x\" 66 420 3)\n\
                         (write \"/d/x\" \"hello\" 0 3)\n\
                         (release 3)\n";

fn run_with(
    log: &str,
    target: &Path,
    sector_size: u64,
    policy: WritebackPolicy,
    controls: &Controls,
) -> Result<Summary, Error> {
    let mut fs = Replayer::new(target, sector_size, policy);
    replay_log(LogReader::new(log.as_bytes()), &mut fs, controls)
}

fn run(
    log: &str,
    target: &Path,
    sector_size: u64,
    policy: WritebackPolicy,
) -> Result<Summary, Error> {
    run_with(log, target, sector_size, policy, &Controls::default())
}

#[test]
fn writeback_all_persists_everything() {
    let target = TempDir::new().unwrap();
    let summary = run(SMALL_LOG, target.path(), 512, WritebackPolicy::All).unwrap();
    assert_eq!(summary.applied, 4);
    assert_eq!(summary.records, 4);
    assert_eq!(fs::read(target.path().join("d/x")).unwrap(), b"hello");
}

#[test]
fn writeback_none_without_fsync_loses_the_data() {
    let target = TempDir::new().unwrap();
    run(SMALL_LOG, target.path(), 512, WritebackPolicy::None).unwrap();
    // Creation is metadata, not buffered data: the file must exist, empty.
    assert_eq!(fs::read(target.path().join("d/x")).unwrap(), b"");
}

#[test]
fn writeback_none_with_fsync_keeps_the_data() {
    let log = "(mkdir \"/d\" 493)\n\
               (create \"/d/x\" 66 420 3)\n\
               (write \"/d/x\" \"hello\" 0 3)\n\
               (fsync \"/d/x\" 0 3)\n\
               (release 3)\n";
    let target = TempDir::new().unwrap();
    run(log, target.path(), 512, WritebackPolicy::None).unwrap();
    assert_eq!(fs::read(target.path().join("d/x")).unwrap(), b"hello");
}

#[test]
fn writeback_odd_keeps_only_odd_sectors_after_power_loss() {
    let log = "(mkdir \"/d\" 493)\n\
               (create \"/d/x\" 66 420 3)\n\
               (write \"/d/x\" \"ABCDEFGH\" 0 3)\n\
               (release 3)\n";
    let target = TempDir::new().unwrap();
    run(log, target.path(), 4, WritebackPolicy::Odd).unwrap();
    // Sector 0 was buffered and lost; sector 1 was written through. The
    // hole left at the front reads back as zeros.
    assert_eq!(fs::read(target.path().join("d/x")).unwrap(), b"\0\0\0\0EFGH");
}

#[test]
fn discarded_partial_write_leaves_the_backing_file_untouched() {
    let target = TempDir::new().unwrap();
    let setup = "(mkdir \"/d\" 493)\n\
                 (create \"/d/x\" 66 420 0)\n\
                 (write \"/d/x\" \"XXXXXXXX\" 0 0)\n\
                 (fsync \"/d/x\" 0 0)\n\
                 (release 0)\n";
    run(setup, target.path(), 512, WritebackPolicy::All).unwrap();

    // Second session: a buffered partial write, then the automatic power
    // loss at end of session. The read-modify-write priming must not have
    // touched the backing file.
    let overlay = "(open \"/d/x\" 2 0)\n\
                   (write \"/d/x\" \"yy\" 3 0)\n\
                   (release 0)\n";
    run(overlay, target.path(), 512, WritebackPolicy::None).unwrap();
    assert_eq!(fs::read(target.path().join("d/x")).unwrap(), b"XXXXXXXX");
}

#[test]
fn malformed_record_reports_line_one() {
    let target = TempDir::new().unwrap();
    let err = run("(mkdir \"/d\" )", target.path(), 512, WritebackPolicy::All).unwrap_err();
    assert_eq!(err.line(), 1);
    assert!(matches!(err, Error::Parse { .. }));
    assert!(!target.path().join("d").exists());
}

#[test]
fn duplicate_handle_id_is_an_error_with_its_line() {
    let log = "(create \"/x\" 66 420 0)\n(create \"/y\" 66 420 0)\n";
    let target = TempDir::new().unwrap();
    let err = run(log, target.path(), 512, WritebackPolicy::All).unwrap_err();
    assert_eq!(err.line(), 2);
    assert!(matches!(
        err,
        Error::Replay {
            source: ReplayError::HandleReused(0),
            ..
        }
    ));
}

#[test]
fn write_to_never_opened_handle_is_an_error() {
    let log = "(write \"/x\" \"a\" 0 9)\n";
    let target = TempDir::new().unwrap();
    let err = run(log, target.path(), 512, WritebackPolicy::All).unwrap_err();
    assert!(matches!(
        err,
        Error::Replay {
            source: ReplayError::UnknownHandle(9),
            ..
        }
    ));
}

#[test]
fn handle_id_can_be_reused_after_release() {
    let log = "(create \"/x\" 66 420 2)\n\
               (release 2)\n\
               (create \"/y\" 66 420 2)\n\
               (write \"/y\" \"ok\" 0 2)\n\
               (release 2)\n";
    let target = TempDir::new().unwrap();
    run(log, target.path(), 512, WritebackPolicy::All).unwrap();
    assert_eq!(fs::read(target.path().join("y")).unwrap(), b"ok");
}

#[test]
fn metadata_operations_reach_the_target_tree() {
    let log = "(mkdir \"/d\" 493)\n\
               (create \"/d/f\" 66 420 0)\n\
               (write \"/d/f\" \"hello world\" 0 0)\n\
               (fsync \"/d/f\" 0 0)\n\
               (ftruncate \"/d/f\" 5 0)\n\
               (release 0)\n\
               (symlink \"/d/f\" \"/d/l\")\n\
               (link \"/d/f\" \"/d/h\")\n\
               (chmod \"/d/f\" 384)\n\
               (truncate \"/d/f\" 4)\n\
               (utimens \"/d/f\" 1000000 0 2000000 500)\n";
    let target = TempDir::new().unwrap();
    run(log, target.path(), 512, WritebackPolicy::All).unwrap();

    let f = target.path().join("d/f");
    // Stat before reading: the reads below would bump atime.
    let meta = fs::metadata(&f).unwrap();
    assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
    assert_eq!(meta.atime(), 1_000_000);
    assert_eq!(meta.mtime(), 2_000_000);

    assert_eq!(fs::read(&f).unwrap(), b"hell");
    // The hard link shares the inode, so it sees the truncate too.
    assert_eq!(fs::read(target.path().join("d/h")).unwrap(), b"hell");
    // Symlink content is the recorded path, not a remapped one.
    assert_eq!(
        fs::read_link(target.path().join("d/l")).unwrap(),
        PathBuf::from("/d/f")
    );
}

#[test]
fn rename_within_a_directory_is_applied() {
    let log = "(mkdir \"/d\" 493)\n\
               (create \"/d/a\" 66 420 0)\n\
               (write \"/d/a\" \"v\" 0 0)\n\
               (release 0)\n\
               (rename \"/d/a\" \"/d/b\")\n";
    let target = TempDir::new().unwrap();
    run(log, target.path(), 512, WritebackPolicy::All).unwrap();
    assert!(!target.path().join("d/a").exists());
    assert_eq!(fs::read(target.path().join("d/b")).unwrap(), b"v");
}

#[test]
fn cross_directory_rename_is_applied_and_committed() {
    let log = "(mkdir \"/d1\" 493)\n\
               (mkdir \"/d2\" 493)\n\
               (create \"/d1/a\" 66 420 0)\n\
               (release 0)\n\
               (rename \"/d1/a\" \"/d2/a\")\n";
    let target = TempDir::new().unwrap();
    run(log, target.path(), 512, WritebackPolicy::All).unwrap();
    assert!(!target.path().join("d1/a").exists());
    assert!(target.path().join("d2/a").exists());
}

#[test]
fn skip_drops_leading_records() {
    let log = "(mkdir \"/a\" 493)\n(mkdir \"/b\" 493)\n";
    let target = TempDir::new().unwrap();
    let controls = Controls {
        skip: 1,
        ..Controls::default()
    };
    let summary = run_with(log, target.path(), 512, WritebackPolicy::All, &controls).unwrap();
    assert_eq!(summary.applied, 1);
    assert!(!target.path().join("a").exists());
    assert!(target.path().join("b").exists());
}

#[test]
fn take_stops_after_n_operations() {
    let log = "(mkdir \"/a\" 493)\n(mkdir \"/b\" 493)\n";
    let target = TempDir::new().unwrap();
    let controls = Controls {
        take: Some(1),
        ..Controls::default()
    };
    let summary = run_with(log, target.path(), 512, WritebackPolicy::All, &controls).unwrap();
    assert_eq!(summary.applied, 1);
    assert!(target.path().join("a").exists());
    assert!(!target.path().join("b").exists());
}

#[test]
fn stop_touch_ends_the_session_before_the_trigger_record() {
    let log = "(mkdir \"/a\" 493)\n\
               (create \"/stop\" 66 420 0)\n\
               (mkdir \"/b\" 493)\n";
    let target = TempDir::new().unwrap();
    let controls = Controls {
        stop_touch: Some(PathBuf::from("/stop")),
        ..Controls::default()
    };
    let summary = run_with(log, target.path(), 512, WritebackPolicy::All, &controls).unwrap();
    assert_eq!(summary.applied, 1);
    assert!(target.path().join("a").exists());
    assert!(!target.path().join("stop").exists());
    assert!(!target.path().join("b").exists());
}

#[test]
fn start_touch_drops_everything_before_the_trigger_record() {
    let log = "(mkdir \"/a\" 493)\n\
               (create \"/go\" 66 420 0)\n\
               (release 0)\n\
               (mkdir \"/b\" 493)\n";
    let target = TempDir::new().unwrap();
    let controls = Controls {
        start_touch: Some(PathBuf::from("/go")),
        ..Controls::default()
    };
    let summary = run_with(log, target.path(), 512, WritebackPolicy::All, &controls).unwrap();
    // The trigger record itself is applied, as is everything after it.
    assert_eq!(summary.applied, 3);
    assert!(!target.path().join("a").exists());
    assert!(target.path().join("go").exists());
    assert!(target.path().join("b").exists());
}

#[test]
fn non_utf8_paths_replay_byte_for_byte() {
    let log = "(mkdir \"/\\xff\\xfe\" 493)\n";
    let target = TempDir::new().unwrap();
    run(log, target.path(), 512, WritebackPolicy::All).unwrap();

    use std::os::unix::ffi::OsStrExt;
    let names: Vec<Vec<u8>> = fs::read_dir(target.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().as_bytes().to_vec())
        .collect();
    assert_eq!(names, vec![b"\xff\xfe".to_vec()]);
}

#[test]
fn sentinel_handle_aborts_instead_of_guessing() {
    let log = "(create \"/x\" 66 420 0)\n\
               (release 0)\n\
               (fsync \"/x\" 0 -1)\n";
    let target = TempDir::new().unwrap();
    let err = run(log, target.path(), 512, WritebackPolicy::All).unwrap_err();
    assert_eq!(err.line(), 3);
    assert!(matches!(
        err,
        Error::Replay {
            source: ReplayError::Unimplemented(_),
            ..
        }
    ));
}
