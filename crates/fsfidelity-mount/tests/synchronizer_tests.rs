//! Mount lifecycle against a scripted stand-in for the mount tool.
//!
//! The fake tool is `sh -c <script> <argsfile> <invocation args...>`: it
//! records its arguments to `<argsfile>` and "mounts" by dropping a marker
//! file into the mountpoint. The oracle looks for that marker and the
//! unmounter deletes it.

#![cfg(unix)]

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fsfidelity_mount::{
    ExitCode, MountCommand, MountDirection, MountError, MountRequest, MountSynchronizer,
    MountTiming, SpawnMode, Unmounter,
};
use tempfile::TempDir;

const MARKER: &str = ".mounted";

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn marker_oracle(path: &Path) -> bool {
    path.join(MARKER).exists()
}

#[derive(Default)]
struct RecordingUnmounter {
    calls: RefCell<Vec<PathBuf>>,
}

impl Unmounter for RecordingUnmounter {
    fn unmount(&self, mountpoint: &Path) -> io::Result<()> {
        self.calls.borrow_mut().push(mountpoint.to_path_buf());
        fs::remove_file(mountpoint.join(MARKER))
    }
}

fn fast_timing() -> MountTiming {
    MountTiming::default()
        .timeout(Duration::from_secs(3))
        .interval(Duration::from_millis(10))
        .grace(Duration::ZERO)
}

/// `sh -c <script> <argsfile>`; the invocation args become `$1..`.
fn fake_tool(script: &str, args_file: &Path) -> MountCommand {
    MountCommand::new("sh")
        .args(["-c", script])
        .arg(args_file.as_os_str())
}

const MOUNTING_SCRIPT: &str = r#"printf '%s\n' "$@" > "$0" && touch "$3/.mounted""#;

type FakeSync = MountSynchronizer<fn(&Path) -> bool, RecordingUnmounter>;

fn synchronizer(command: MountCommand, timing: MountTiming) -> FakeSync {
    MountSynchronizer::with_parts(
        command,
        timing,
        marker_oracle as fn(&Path) -> bool,
        RecordingUnmounter::default(),
    )
}

#[test]
fn test_mount_and_finish() {
    init_test_logging();
    let temp = TempDir::new().unwrap();
    let args_file = temp.path().join("args");
    let mountpoint = temp.path().join("mnt");
    let sync = synchronizer(fake_tool(MOUNTING_SCRIPT, &args_file), fast_timing());

    let guard = sync
        .mount("/backups/repo", Some(&mountpoint), &["-o", "ro"], MountRequest::default())
        .unwrap();
    assert!(guard.is_mounted());
    assert!(marker_oracle(&mountpoint));

    let recorded = fs::read_to_string(&args_file).unwrap();
    let expected = format!("--repo=/backups/repo\nmount\n{}\n-o\nro\n", mountpoint.display());
    assert_eq!(recorded, expected);

    guard.finish().unwrap();
    assert_eq!(*sync.unmounter().calls.borrow(), vec![mountpoint.clone()]);
    assert!(!mountpoint.exists());
}

#[test]
fn test_drop_tears_down() {
    let temp = TempDir::new().unwrap();
    let mountpoint = temp.path().join("mnt");
    let sync = synchronizer(
        fake_tool(MOUNTING_SCRIPT, &temp.path().join("args")),
        fast_timing(),
    );
    {
        let _guard = sync
            .mount("repo", Some(&mountpoint), &[], MountRequest::default())
            .unwrap();
    }
    assert_eq!(sync.unmounter().calls.borrow().len(), 1);
    assert!(!mountpoint.exists());
}

#[test]
fn test_temporary_mountpoint_is_removed() {
    let temp = TempDir::new().unwrap();
    let sync = synchronizer(
        fake_tool(MOUNTING_SCRIPT, &temp.path().join("args")),
        fast_timing(),
    );
    let mountpoint = sync
        .with_mount("repo", None, &[], MountRequest::default(), Path::to_path_buf)
        .unwrap();
    assert!(!mountpoint.exists());
    assert_eq!(*sync.unmounter().calls.borrow(), vec![mountpoint]);
}

#[test]
fn test_with_mount_returns_closure_value() {
    let temp = TempDir::new().unwrap();
    let sync = synchronizer(
        fake_tool(MOUNTING_SCRIPT, &temp.path().join("args")),
        fast_timing(),
    );
    let names = sync
        .with_mount(
            "repo",
            Some(&temp.path().join("mnt")),
            &[],
            MountRequest::default(),
            |mnt| -> anyhow::Result<Vec<String>> {
                Ok(fs::read_dir(mnt)?
                    .map(|e| e.map(|e| e.file_name().to_string_lossy().into_owned()))
                    .collect::<io::Result<_>>()?)
            },
        )
        .unwrap()
        .unwrap();
    assert_eq!(names, vec![MARKER.to_string()]);
}

#[test]
fn test_expected_error_returns_without_waiting() {
    let temp = TempDir::new().unwrap();
    let mountpoint = temp.path().join("mnt");
    let timing = fast_timing().timeout(Duration::from_secs(10));
    let sync = synchronizer(fake_tool("exit 2", &temp.path().join("args")), timing);

    let start = Instant::now();
    let guard = sync
        .mount(
            "repo",
            Some(&mountpoint),
            &[],
            MountRequest::default().expect_exit(ExitCode::Error),
        )
        .unwrap();
    assert!(!guard.is_mounted());
    guard.finish().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    // nothing to unmount; the mountpoint belongs to the caller now
    assert!(sync.unmounter().calls.borrow().is_empty());
    assert!(mountpoint.is_dir());
}

#[test]
fn test_unexpected_exit_code() {
    let temp = TempDir::new().unwrap();
    let sync = synchronizer(fake_tool("exit 1", &temp.path().join("args")), fast_timing());
    let mountpoint = temp.path().join("mnt");

    let err = sync
        .mount("repo", Some(&mountpoint), &[], MountRequest::default())
        .unwrap_err();
    assert!(
        matches!(
            err,
            MountError::UnexpectedExit {
                expected: ExitCode::Success,
                actual: Some(1),
            }
        ),
        "{err}"
    );
    assert!(!mountpoint.exists());
}

#[test]
fn test_warning_exit_accepted_when_expected() {
    let temp = TempDir::new().unwrap();
    let script = r#"touch "$3/.mounted"; exit 1"#;
    let sync = synchronizer(fake_tool(script, &temp.path().join("args")), fast_timing());

    sync.with_mount(
        "repo",
        Some(&temp.path().join("mnt")),
        &[],
        MountRequest::default().expect_exit(ExitCode::Warning),
        |_| (),
    )
    .unwrap();
}

#[test]
fn test_mount_wait_is_bounded() {
    let temp = TempDir::new().unwrap();
    let timeout = Duration::from_millis(300);
    let interval = Duration::from_millis(25);
    let timing = fast_timing().timeout(timeout).interval(interval);
    let sync = synchronizer(fake_tool("exit 0", &temp.path().join("args")), timing);
    let mountpoint = temp.path().join("mnt");

    let start = Instant::now();
    let err = sync
        .mount("repo", Some(&mountpoint), &[], MountRequest::default())
        .unwrap_err();
    let elapsed = start.elapsed();

    match err {
        MountError::Timeout {
            direction,
            mountpoint: reported,
            ..
        } => {
            assert_eq!(direction, MountDirection::Mount);
            assert_eq!(reported, mountpoint);
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(elapsed >= timeout, "{elapsed:?}");
    // process startup plus one interval of overshoot
    assert!(elapsed < timeout + interval + Duration::from_secs(2), "{elapsed:?}");
    assert!(!mountpoint.exists());
}

#[test]
fn test_missing_tool_removes_mountpoint() {
    let temp = TempDir::new().unwrap();
    let mountpoint = temp.path().join("mnt");
    let sync = synchronizer(MountCommand::new("/nonexistent/fsfidelity-tool"), fast_timing());

    let err = sync
        .mount("repo", Some(&mountpoint), &[], MountRequest::default())
        .unwrap_err();
    assert!(matches!(err, MountError::Launch(_)), "{err}");
    assert!(!mountpoint.exists());
}

#[test]
fn test_existing_mountpoint_is_rejected() {
    let temp = TempDir::new().unwrap();
    let sync = synchronizer(
        fake_tool(MOUNTING_SCRIPT, &temp.path().join("args")),
        fast_timing(),
    );
    let err = sync
        .mount("repo", Some(temp.path()), &[], MountRequest::default())
        .unwrap_err();
    assert!(matches!(err, MountError::Mountpoint { .. }), "{err}");
}

#[test]
fn test_double_fork_mount() {
    init_test_logging();
    let temp = TempDir::new().unwrap();
    let mountpoint = temp.path().join("mnt");
    // the detached grandchild mounts a little later
    let script = r#"sleep 0.1; touch "$3/.mounted""#;
    let sync = synchronizer(fake_tool(script, &temp.path().join("args")), fast_timing());

    let guard = sync
        .mount(
            "repo",
            Some(&mountpoint),
            &[],
            MountRequest::default().spawn_mode(SpawnMode::DoubleFork),
        )
        .unwrap();
    assert!(marker_oracle(guard.mountpoint()));
    guard.finish().unwrap();
    assert!(!mountpoint.exists());
}

#[test]
fn test_unmount_timeout_is_reported() {
    let temp = TempDir::new().unwrap();
    let mountpoint = temp.path().join("mnt");
    let timing = fast_timing().timeout(Duration::from_millis(200));

    struct StuckUnmounter;
    impl Unmounter for StuckUnmounter {
        fn unmount(&self, _mountpoint: &Path) -> io::Result<()> {
            Ok(())
        }
    }

    let sync = MountSynchronizer::with_parts(
        fake_tool(MOUNTING_SCRIPT, &temp.path().join("args")),
        timing,
        marker_oracle as fn(&Path) -> bool,
        StuckUnmounter,
    );
    let guard = sync
        .mount("repo", Some(&mountpoint), &[], MountRequest::default())
        .unwrap();
    let err = guard.finish().unwrap_err();
    assert!(
        matches!(
            err,
            MountError::Timeout {
                direction: MountDirection::Unmount,
                ..
            }
        ),
        "{err}"
    );
    assert!(mountpoint.join(".mounted").exists());
}
