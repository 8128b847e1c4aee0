use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

const MUTEX_1: usize = 0x003E_F37E;
const MUTEX_2: usize = 0x00A0_FC9E;
const EXIT_CALL: usize = 0x00A1_5978;
const CALL_BYTES: [u8; 6] = [0xFF, 0x15, 0x14, 0xE4, 0x5B, 0x11];
const JZ_NEAR: [u8; 6] = [0x0F, 0x84, 0x46, 0x04, 0x00, 0x00];
const FIXTURE_LEN: usize = 0x00A1_6000;

fn patcher_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_wechat-multipatch"))
}

/// A stand-in for WeChatWin.dll 3.2.1.156 with the three sites in place.
fn pristine_dll() -> Vec<u8> {
    let mut data: Vec<u8> = (0..FIXTURE_LEN).map(|i| (i % 251) as u8).collect();
    data[MUTEX_1] = 0x74;
    data[MUTEX_2] = 0x75;
    data[EXIT_CALL..EXIT_CALL + 6].copy_from_slice(&CALL_BYTES);
    data
}

fn write_dll(dir: &Path, data: &[u8]) -> PathBuf {
    let path = dir.join("WeChatWin.dll");
    fs::write(&path, data).unwrap();
    path
}

fn run(args: &[&str], stdin: Option<&str>) -> Output {
    let mut child = Command::new(patcher_exe())
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to run patcher");

    if let Some(input) = stdin {
        child
            .stdin
            .take()
            .unwrap()
            .write_all(input.as_bytes())
            .unwrap();
    }
    child.wait_with_output().unwrap()
}

fn patch(dll: &Path, version: &str) -> Output {
    run(
        &[
            "patch",
            "--dll",
            dll.to_str().unwrap(),
            "--product-version",
            version,
            "--no-kill",
        ],
        None,
    )
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_only_sites_changed(before: &[u8], after: &[u8]) {
    assert_eq!(before.len(), after.len(), "file size changed");
    let touched = |i: usize| {
        (MUTEX_1..MUTEX_1 + 6).contains(&i) || i == MUTEX_2 || (EXIT_CALL..EXIT_CALL + 6).contains(&i)
    };
    let stray: Vec<usize> = before
        .iter()
        .zip(after)
        .enumerate()
        .filter(|(i, (a, b))| a != b && !touched(*i))
        .map(|(i, _)| i)
        .collect();
    assert!(stray.is_empty(), "unexpected bytes changed at {:X?}", stray);
}

#[test]
fn test_full_patch_then_idempotent_rerun() {
    let temp = tempfile::tempdir().unwrap();
    let original = pristine_dll();
    let dll = write_dll(temp.path(), &original);

    let output = patch(&dll, "3.2.1.156");
    assert_eq!(
        output.status.code(),
        Some(0),
        "patch failed:\nstdout: {}\nstderr: {}",
        stdout(&output),
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout(&output).contains("Patch applied successfully!"));

    let patched = fs::read(&dll).unwrap();
    assert_eq!(patched[MUTEX_1], 0xEB);
    assert_eq!(patched[MUTEX_2], 0xEB);
    assert_eq!(&patched[EXIT_CALL..EXIT_CALL + 6], &[0x90; 6]);
    assert_only_sites_changed(&original, &patched);

    let backup = temp.path().join("WeChatWin.dll.bak");
    assert_eq!(fs::read(&backup).unwrap(), original);

    // Second run recognises its own work and leaves everything alone.
    let output = patch(&dll, "3.2.1.156");
    assert_eq!(output.status.code(), Some(2));
    let text = stdout(&output);
    assert_eq!(text.matches("(already patched)").count(), 3, "{}", text);
    assert_eq!(fs::read(&dll).unwrap(), patched);
    assert_eq!(fs::read(&backup).unwrap(), original);
}

#[test]
fn test_near_jump_encoding_is_patched() {
    let temp = tempfile::tempdir().unwrap();
    let mut original = pristine_dll();
    original[MUTEX_1..MUTEX_1 + 6].copy_from_slice(&JZ_NEAR);
    let dll = write_dll(temp.path(), &original);

    let output = patch(&dll, "3.2.1.156");
    assert_eq!(output.status.code(), Some(0), "{}", stdout(&output));
    assert!(stdout(&output).contains("patch mutex_jump #1 @0x003EF37E: 0F 84 46 04 00 00 -> 90 E9 46 04 00 00"));

    let patched = fs::read(&dll).unwrap();
    assert_eq!(&patched[MUTEX_1..MUTEX_1 + 6], &[0x90, 0xE9, 0x46, 0x04, 0x00, 0x00]);
    assert_eq!(patched[MUTEX_2], 0xEB);
    assert_eq!(&patched[EXIT_CALL..EXIT_CALL + 6], &[0x90; 6]);
    assert_only_sites_changed(&original, &patched);

    let output = patch(&dll, "3.2.1.156");
    assert_eq!(output.status.code(), Some(2));
    let text = stdout(&output);
    assert!(text.contains("found 90 E9 46 04 00 00 (already patched)"), "{}", text);
    assert_eq!(fs::read(&dll).unwrap(), patched);
}

#[test]
fn test_mismatched_site_does_not_block_others() {
    let temp = tempfile::tempdir().unwrap();
    let mut original = pristine_dll();
    original[MUTEX_1] = 0x90;
    let dll = write_dll(temp.path(), &original);

    let output = patch(&dll, "3.2.1.156");
    assert_eq!(output.status.code(), Some(2));
    let text = stdout(&output);
    assert!(text.contains("skip  mutex_jump #1 @0x003EF37E: found 90 "), "{}", text);
    assert!(text.contains("expected 74 | 75 | 0F 84 46 04 00 00"), "{}", text);

    let patched = fs::read(&dll).unwrap();
    assert_eq!(patched[MUTEX_1], 0x90);
    assert_eq!(patched[MUTEX_2], 0xEB);
    assert_eq!(&patched[EXIT_CALL..EXIT_CALL + 6], &[0x90; 6]);
    assert_only_sites_changed(&original, &patched);
}

#[test]
fn test_truncated_file_is_never_partially_written() {
    let temp = tempfile::tempdir().unwrap();
    let mut original = pristine_dll();
    original.truncate(EXIT_CALL + 3);
    let dll = write_dll(temp.path(), &original);

    let output = patch(&dll, "3.2.1.156");
    assert_eq!(output.status.code(), Some(2));

    let patched = fs::read(&dll).unwrap();
    assert_eq!(patched.len(), original.len());
    assert_eq!(patched[MUTEX_1], 0xEB);
    assert_eq!(patched[MUTEX_2], 0xEB);
    assert_eq!(&patched[EXIT_CALL..], &CALL_BYTES[..3]);
}

#[test]
fn test_declined_version_mismatch_touches_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let original = pristine_dll();
    let dll = write_dll(temp.path(), &original);

    let output = run(
        &[
            "patch",
            "--dll",
            dll.to_str().unwrap(),
            "--product-version",
            "3.9.0.28",
            "--no-kill",
        ],
        Some("n\n"),
    );
    assert_eq!(output.status.code(), Some(3));
    assert!(stdout(&output).contains("Continue? (y/N)"));
    assert_eq!(fs::read(&dll).unwrap(), original);
    assert!(!temp.path().join("WeChatWin.dll.bak").exists());
}

#[test]
fn test_confirmed_version_mismatch_proceeds() {
    let temp = tempfile::tempdir().unwrap();
    let dll = write_dll(temp.path(), &pristine_dll());

    let output = run(
        &["patch", "--dll", dll.to_str().unwrap(), "--no-kill"],
        Some("y\n"),
    );
    assert_eq!(output.status.code(), Some(0), "{}", stdout(&output));
    assert!(stdout(&output).contains("(unknown version)"));
    assert_eq!(fs::read(&dll).unwrap()[MUTEX_1], 0xEB);
}

#[test]
fn test_check_is_read_only() {
    let temp = tempfile::tempdir().unwrap();
    let mut original = pristine_dll();
    original[MUTEX_2] = 0xEB;
    let dll = write_dll(temp.path(), &original);

    let output = run(&["check", "--dll", dll.to_str().unwrap()], None);
    assert_eq!(output.status.code(), Some(0));
    let text = stdout(&output);
    assert!(text.contains("mutex_jump #1 @0x003EF37E: found 74, would write EB"), "{}", text);
    assert!(text.contains("mutex_jump #2 @0x00A0FC9E: found EB, already patched"), "{}", text);
    assert!(text.contains("exit_call @0x00A15978: found FF 15 14 E4 5B 11, would write 90 90 90 90 90 90"));
    assert_eq!(fs::read(&dll).unwrap(), original);
}

#[test]
fn test_restore_undoes_patch() {
    let temp = tempfile::tempdir().unwrap();
    let original = pristine_dll();
    let dll = write_dll(temp.path(), &original);

    assert_eq!(patch(&dll, "3.2.1.156").status.code(), Some(0));
    assert_ne!(fs::read(&dll).unwrap(), original);

    let output = run(&["restore", "--dll", dll.to_str().unwrap(), "--no-kill"], None);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(fs::read(&dll).unwrap(), original);
    assert!(stdout(&output).contains(blake3::hash(&original).to_hex().as_str()));
}

#[test]
fn test_missing_target_aborts() {
    let temp = tempfile::tempdir().unwrap();
    let dll = temp.path().join("WeChatWin.dll");

    let output = patch(&dll, "3.2.1.156");
    assert_eq!(output.status.code(), Some(3));
    assert!(!temp.path().join("WeChatWin.dll.bak").exists());
}

#[test]
fn test_usage_error_is_not_reported_as_partial() {
    let temp = tempfile::tempdir().unwrap();
    let original = pristine_dll();
    let dll = write_dll(temp.path(), &original);

    let output = run(&["patch", "--dll", dll.to_str().unwrap(), "--bogus-flag"], None);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--bogus-flag"));
    assert_eq!(fs::read(&dll).unwrap(), original);

    let output = run(&["--help"], None);
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("patch"));

    let output = run(&["--version"], None);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn test_verbose_flag_enables_debug_logging() {
    let temp = tempfile::tempdir().unwrap();
    let dll = write_dll(temp.path(), &pristine_dll());

    let output = patch(&dll, "3.2.1.156");
    assert!(!stdout(&output).contains("for patching"), "{}", stdout(&output));

    let dll = write_dll(temp.path(), &pristine_dll());
    let output = run(
        &[
            "-v",
            "patch",
            "--dll",
            dll.to_str().unwrap(),
            "--product-version",
            "3.2.1.156",
            "--no-kill",
        ],
        None,
    );
    assert_eq!(output.status.code(), Some(0), "{}", stdout(&output));
    assert!(stdout(&output).contains("for patching"), "{}", stdout(&output));
}
