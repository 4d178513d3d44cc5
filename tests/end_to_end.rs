//! End-to-end CLI test, grounded on spec.md §8's scenario 1 ("single full
//! barcode, stationary"): runs the built `chiptrack` binary over a small
//! synthetic `.blobs` fixture and checks the written barcode table and log
//! file match what the ten-phase pipeline should produce.

use std::fs;
use std::process::Command;

fn write_fixture(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let colorid_path = dir.join("colorids.txt");
    fs::write(&colorid_path, "R 0\nG 1\nB 2\n\nRGB\n").unwrap();

    // Ten stationary frames of R,G,B at (100,100),(130,100),(160,100), no
    // motion blobs -- spec.md §8 scenario 1.
    let mut blobs_text = String::new();
    for f in 0..10u32 {
        blobs_text.push_str(&format!("{f} 3 0\n"));
        blobs_text.push_str("0 100.0 100.0 5.0\n");
        blobs_text.push_str("1 130.0 100.0 5.0\n");
        blobs_text.push_str("2 160.0 100.0 5.0\n");
    }
    let blobs_path = dir.join("input.blobs");
    fs::write(&blobs_path, blobs_text).unwrap();

    (colorid_path, blobs_path)
}

#[test]
fn cli_reconstructs_single_stationary_barcode() {
    let dir = tempfile::tempdir().unwrap();
    let (colorid_path, blobs_path) = write_fixture(dir.path());
    let output_path = dir.path().join("out.barcodes");

    let status = Command::new(env!("CARGO_BIN_EXE_chiptrack"))
        .arg("-i")
        .arg(&blobs_path)
        .arg("-c")
        .arg(&colorid_path)
        .arg("-o")
        .arg(&output_path)
        .status()
        .expect("failed to run chiptrack binary");
    assert!(status.success());

    let out_text = fs::read_to_string(&output_path).unwrap();
    assert!(out_text.contains("# number of IDs: 1"));
    assert!(out_text.contains("# number of frames: 10"));

    // Every one of the 10 frame lines carries exactly one barcode, colorid
    // "RGB", at the expected center and orientation (pointing from blue back
    // toward red, i.e. 180 degrees).
    let frame_lines: Vec<&str> = out_text.lines().filter(|l| !l.starts_with('#') && !l.trim().is_empty()).collect();
    assert_eq!(frame_lines.len(), 10);
    for line in &frame_lines {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields[1], "1", "each frame should emit exactly one chosen barcode");
        assert_eq!(fields[2], "RGB");
        let cx: f64 = fields[3].parse().unwrap();
        let cy: f64 = fields[4].parse().unwrap();
        assert!((cx - 130.0).abs() < 2.0);
        assert!((cy - 100.0).abs() < 2.0);
        let orientation_deg: f64 = fields[7].parse().unwrap();
        assert!((orientation_deg.abs() - 180.0).abs() < 2.0);
    }

    let log_path = output_path.with_extension("log");
    let log_text = fs::read_to_string(&log_path).unwrap();
    assert!(log_text.contains("NUB"));
}

#[test]
fn cli_refuses_to_overwrite_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let (colorid_path, blobs_path) = write_fixture(dir.path());
    let output_path = dir.path().join("out.barcodes");
    fs::write(&output_path, "pre-existing").unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_chiptrack"))
        .arg("-i")
        .arg(&blobs_path)
        .arg("-c")
        .arg(&colorid_path)
        .arg("-o")
        .arg(&output_path)
        .status()
        .expect("failed to run chiptrack binary");
    assert!(!status.success());
    assert_eq!(fs::read_to_string(&output_path).unwrap(), "pre-existing");
}

#[test]
fn cli_max_frames_flag_truncates_output() {
    let dir = tempfile::tempdir().unwrap();
    let (colorid_path, blobs_path) = write_fixture(dir.path());
    let output_path = dir.path().join("out.barcodes");

    let status = Command::new(env!("CARGO_BIN_EXE_chiptrack"))
        .arg("-i")
        .arg(&blobs_path)
        .arg("-c")
        .arg(&colorid_path)
        .arg("-o")
        .arg(&output_path)
        .arg("-n")
        .arg("3")
        .status()
        .expect("failed to run chiptrack binary");
    assert!(status.success());

    let out_text = fs::read_to_string(&output_path).unwrap();
    assert!(out_text.contains("# number of frames: 3"));
}
