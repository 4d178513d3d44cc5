//! CLI entry point for the `chiptrack` batch pipeline (spec.md §6).
//!
//! Wires `clap` argument parsing, `tracing-subscriber` logging, and the
//! library's typed I/O parsers/writers around `chiptrack::run`, in the
//! `clap` + `anyhow::Context` + `tracing` style `freddiehaddad-oxidized`
//! wires its own binary around its library crate (see DESIGN.md).

use anyhow::{bail, Context, Result};
use chiptrack::core_modules::settings::ProjectSettings;
use chiptrack::io::{BarcodeTextWriter, Calibration, UnusedBlobLogWriter};
use chiptrack::pipeline::RunOptions;
use clap::Parser;
use std::fs;
use std::path::PathBuf;

/// Reconstructs per-identity trajectories from a stream of per-frame
/// color-blob detections.
#[derive(Parser, Debug)]
#[command(name = "chiptrack", version, about)]
struct Cli {
    /// Input blobs file (`.blobs`).
    #[arg(short = 'i', long = "input", value_name = "FILE")]
    input: PathBuf,

    /// Colorid table file.
    #[arg(short = 'c', long = "colorid", value_name = "FILE")]
    colorid: PathBuf,

    /// Optional world-coordinate calibration file.
    #[arg(short = 'k', long = "calibration", value_name = "FILE")]
    calibration: Option<PathBuf>,

    /// Optional TOML project settings file; built-in defaults are used when
    /// absent.
    #[arg(short = 's', long = "settings", value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Output barcode-table path; a sibling `.log` file is written alongside
    /// it with the per-frame unused-blob-index report.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    output: PathBuf,

    /// Process at most this many frames.
    #[arg(short = 'n', long = "max-frames", value_name = "N")]
    max_frames: Option<usize>,

    /// Skip phases 8-10 (trajectory construction, selection, finalization).
    #[arg(long = "nt")]
    skip_trajectory_phases: bool,

    /// Do not write soft-deleted barcodes to the output table.
    #[arg(long = "nd")]
    no_deleted: bool,

    /// Debug checkpoint load level (reserved; checkpoint serialization is an
    /// external collaborator per spec.md §1, not implemented here).
    #[arg(long = "dl", value_name = "LEVEL")]
    debug_load: Option<u8>,

    /// Debug checkpoint save level (reserved, see `--dl`).
    #[arg(long = "ds", value_name = "LEVEL")]
    debug_save: Option<u8>,

    /// Stop after the named phase (1-10) and write out whatever state
    /// exists at that point.
    #[arg(long = "de", value_name = "PHASE")]
    debug_end: Option<u8>,

    /// Overwrite the output file if it already exists.
    #[arg(short = 'f', long = "force")]
    force: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Some(level) = cli.debug_load {
        tracing::warn!(level, "checkpoint loading (-dl) is not implemented; starting from raw input");
    }
    if let Some(level) = cli.debug_save {
        tracing::warn!(level, "checkpoint saving (-ds) is not implemented; no checkpoint will be written");
    }

    if cli.output.exists() && !cli.force {
        bail!("output file {:?} already exists; pass -f to overwrite", cli.output);
    }

    let colorid_text = fs::read_to_string(&cli.colorid)
        .with_context(|| format!("reading colorid file {:?}", cli.colorid))?;
    let colorids = chiptrack::io::parse_colorid_file(&colorid_text)
        .with_context(|| format!("parsing colorid file {:?}", cli.colorid))?;

    let settings = match &cli.settings {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading settings file {path:?}"))?;
            ProjectSettings::from_toml_str(&text).with_context(|| format!("parsing settings file {path:?}"))?
        }
        None => ProjectSettings::default(),
    };

    let calibration = match &cli.calibration {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading calibration file {path:?}"))?;
            Calibration::parse(&text).with_context(|| format!("parsing calibration file {path:?}"))?
        }
        None => Calibration::identity_absent(),
    };

    let blob_text = fs::read_to_string(&cli.input)
        .with_context(|| format!("reading blob file {:?}", cli.input))?;
    let frames_in = chiptrack::io::parse_blob_file(&blob_text, cli.max_frames)
        .with_context(|| format!("parsing blob file {:?}", cli.input))?;
    let num_frames = frames_in.len();

    let options = RunOptions {
        skip_trajectory_phases: cli.skip_trajectory_phases,
        debug_end_phase: cli.debug_end,
    };

    let output = chiptrack::run(&colorids, &settings, frames_in, &options)
        .context("pipeline run failed")?;

    let out_file = fs::File::create(&cli.output)
        .with_context(|| format!("creating output file {:?}", cli.output))?;
    let mut writer = BarcodeTextWriter::new(std::io::BufWriter::new(out_file), colorids.len(), num_frames)
        .context("writing barcode output header")?;
    for (f, frame) in output.frames.iter().enumerate() {
        writer
            .write_frame(f as u64, frame, &colorids, &calibration, !cli.no_deleted)
            .with_context(|| format!("writing barcode output for frame {f}"))?;
    }
    writer.flush().context("flushing barcode output")?;

    let log_path = cli.output.with_extension("log");
    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("creating log file {log_path:?}"))?;
    let mut log_writer = UnusedBlobLogWriter::new(std::io::BufWriter::new(log_file))
        .context("writing log header")?;
    for (f, unused) in output.unused_blob_indices.iter().enumerate() {
        log_writer
            .write_frame(f as u64, unused)
            .with_context(|| format!("writing log entry for frame {f}"))?;
    }
    log_writer.flush().context("flushing log file")?;

    for (frame, conflict) in &output.conflicts {
        tracing::warn!(frame, ctype = ?conflict.ctype, "unresolved conflict in final output");
    }

    tracing::info!(
        num_frames,
        num_colorids = colorids.len(),
        num_conflicts = output.conflicts.len(),
        "pipeline complete"
    );

    Ok(())
}
