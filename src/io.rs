// THEORY:
// Typed-input/output adapters at the system boundary (spec.md §6). These
// parsers and writers are external collaborators the core pipeline never
// imports -- only the `core_modules::types` structs they produce/consume
// cross that line, preserving the separation spec.md §1 calls for. Grounded
// on `trajognize.output`'s barcode textfile/log format and the shapes
// `trajognize.init` defines for colorids and blobs.

use crate::core_modules::settings::LightCondition;
use crate::core_modules::types::{Barcode, ColorBlob, ColoridTable, MFix, MotionBlob};
use crate::error::{Result, TrajognizeError};
use std::collections::HashMap;
use std::io::Write;

/// Parses a colorid table text file: one line per identity,
/// `SYMBOLSTRING SYMBOL1=COLOR1 SYMBOL2=COLOR2 ...` is overkill for a plain
/// text format, so the encoding used here is one identity per line as
/// `STRID` (e.g. `RGB`), followed by a blank-line-separated symbol table
/// section mapping each character to an integer color id, one
/// `SYMBOL INTEGER` pair per line.
///
/// ```text
/// R 0
/// G 1
/// B 2
///
/// RGB
/// BGR
/// ```
pub fn parse_colorid_file(text: &str) -> Result<ColoridTable> {
    let mut color_to_int = HashMap::new();
    let mut int_to_color = HashMap::new();
    let mut strids = Vec::new();
    let mut in_strid_section = false;

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            if !color_to_int.is_empty() {
                in_strid_section = true;
            }
            continue;
        }
        if !in_strid_section {
            let mut parts = line.split_whitespace();
            let symbol = parts.next().ok_or_else(|| parse_err("colorid_file", lineno, "missing symbol"))?;
            let value = parts.next().ok_or_else(|| parse_err("colorid_file", lineno, "missing color value"))?;
            let ch = symbol.chars().next().ok_or_else(|| parse_err("colorid_file", lineno, "empty symbol"))?;
            let v: u32 = value.parse().map_err(|_| parse_err("colorid_file", lineno, "color value not an integer"))?;
            color_to_int.insert(ch, v);
            int_to_color.insert(v, ch);
        } else {
            let mut strid = Vec::with_capacity(line.len());
            for ch in line.chars() {
                let v = *color_to_int
                    .get(&ch)
                    .ok_or_else(|| parse_err("colorid_file", lineno, "colorid references undeclared symbol"))?;
                strid.push(v);
            }
            strids.push(strid);
        }
    }

    ColoridTable::new(strids, color_to_int, int_to_color).map_err(TrajognizeError::Config)
}

/// One frame's worth of detections, ready to seed `core_modules` state.
#[derive(Debug, Clone, Default)]
pub struct FrameBlobs {
    pub color_blobs: Vec<ColorBlob>,
    pub motion_blobs: Vec<MotionBlob>,
}

/// Parses the `.blobs` input: one block per frame, first line
/// `framenum colorblobcount motionblobcount`, then `colorblobcount` lines of
/// `color cx cy radius` and `motionblobcount` lines of
/// `cx cy axisA axisB orientation`. `max_frames` truncates reading early for
/// the CLI's `-n` debug flag (spec.md §6).
pub fn parse_blob_file(text: &str, max_frames: Option<usize>) -> Result<Vec<FrameBlobs>> {
    let mut frames = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((lineno, raw_line)) = lines.next() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(limit) = max_frames {
            if frames.len() >= limit {
                break;
            }
        }

        let mut header = line.split_whitespace();
        let _framenum: u64 = header
            .next()
            .ok_or_else(|| parse_err("blob_file", lineno, "missing frame number"))?
            .parse()
            .map_err(|_| parse_err("blob_file", lineno, "frame number not an integer"))?;
        let color_count: usize = header
            .next()
            .ok_or_else(|| parse_err("blob_file", lineno, "missing color blob count"))?
            .parse()
            .map_err(|_| parse_err("blob_file", lineno, "color blob count not an integer"))?;
        let motion_count: usize = header
            .next()
            .ok_or_else(|| parse_err("blob_file", lineno, "missing motion blob count"))?
            .parse()
            .map_err(|_| parse_err("blob_file", lineno, "motion blob count not an integer"))?;

        let mut frame = FrameBlobs::default();
        for _ in 0..color_count {
            let (cl, craw) = lines.next().ok_or_else(|| parse_err("blob_file", lineno, "missing color blob line"))?;
            let mut fields = craw.split_whitespace();
            let color: u32 = field(&mut fields, "blob_file", cl, "color")?;
            let cx: f64 = field(&mut fields, "blob_file", cl, "center x")?;
            let cy: f64 = field(&mut fields, "blob_file", cl, "center y")?;
            let radius: f64 = field(&mut fields, "blob_file", cl, "radius")?;
            frame.color_blobs.push(ColorBlob::new(color, (cx, cy), radius));
        }
        for _ in 0..motion_count {
            let (ml, mraw) = lines.next().ok_or_else(|| parse_err("blob_file", lineno, "missing motion blob line"))?;
            let mut fields = mraw.split_whitespace();
            let cx: f64 = field(&mut fields, "blob_file", ml, "center x")?;
            let cy: f64 = field(&mut fields, "blob_file", ml, "center y")?;
            let axis_a: f64 = field(&mut fields, "blob_file", ml, "axis a")?;
            let axis_b: f64 = field(&mut fields, "blob_file", ml, "axis b")?;
            let orientation: f64 = field(&mut fields, "blob_file", ml, "orientation")?;
            frame.motion_blobs.push(MotionBlob { center: (cx, cy), axis_a, axis_b, orientation });
        }
        frames.push(frame);
    }

    Ok(frames)
}

fn field<'a, T: std::str::FromStr>(
    fields: &mut impl Iterator<Item = &'a str>,
    file: &'static str,
    lineno: usize,
    what: &'static str,
) -> Result<T> {
    fields
        .next()
        .ok_or_else(|| parse_err(file, lineno, what))?
        .parse()
        .map_err(|_| parse_err(file, lineno, what))
}

fn parse_err(file: &'static str, line: usize, message: &'static str) -> TrajognizeError {
    TrajognizeError::Parse { file: file.to_string(), line, message: message.to_string() }
}

/// World-coordinate calibration: an affine map from image pixels to world
/// units. Absent calibration (spec.md §6) yields `(0.0, 0.0)` for every
/// point.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub origin: (f64, f64),
    pub scale: (f64, f64),
}

impl Calibration {
    pub fn identity_absent() -> Self {
        Self { origin: (0.0, 0.0), scale: (0.0, 0.0) }
    }

    pub fn to_world(&self, point: (f64, f64)) -> (f64, f64) {
        ((point.0 - self.origin.0) * self.scale.0, (point.1 - self.origin.1) * self.scale.1)
    }

    /// Parses `ORIGINX ORIGINY SCALEX SCALEY` from a one-line calibration
    /// file.
    pub fn parse(text: &str) -> Result<Self> {
        let line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let mut fields = line.split_whitespace();
        let origin_x: f64 = field(&mut fields, "calibration", 0, "origin x")?;
        let origin_y: f64 = field(&mut fields, "calibration", 0, "origin y")?;
        let scale_x: f64 = field(&mut fields, "calibration", 0, "scale x")?;
        let scale_y: f64 = field(&mut fields, "calibration", 0, "scale y")?;
        Ok(Self { origin: (origin_x, origin_y), scale: (scale_x, scale_y) })
    }
}

/// A sparse keyframe: from this frame number onward (until the next entry),
/// the given light condition holds.
#[derive(Debug, Clone, Copy)]
pub struct LightKeyframe {
    pub frame: u64,
    pub condition: LightCondition,
}

/// Parses `frame CONDITION` lines into a sorted sparse keyframe log, then
/// expand with `resolve_light_at` (last-known-value interpolation).
pub fn parse_light_keyframe_log(text: &str) -> Result<Vec<LightKeyframe>> {
    let mut out = Vec::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let frame: u64 = field(&mut fields, "keyframe_log", lineno, "frame number")?;
        let condition_str = fields.next().ok_or_else(|| parse_err("keyframe_log", lineno, "missing light condition"))?;
        let condition = match condition_str.to_uppercase().as_str() {
            "DAYLIGHT" => LightCondition::Daylight,
            "NIGHTLIGHT" => LightCondition::Nightlight,
            "EXTRALIGHT" => LightCondition::Extralight,
            _ => return Err(parse_err("keyframe_log", lineno, "unknown light condition")),
        };
        out.push(LightKeyframe { frame, condition });
    }
    out.sort_by_key(|k| k.frame);
    Ok(out)
}

/// Last-known-value lookup: the condition in effect at `frame`, or `None` if
/// `frame` precedes every keyframe.
pub fn resolve_light_at(log: &[LightKeyframe], frame: u64) -> Option<LightCondition> {
    log.iter().rev().find(|k| k.frame <= frame).map(|k| k.condition)
}

/// A half-open `[start, end)` frame interval excised from processing
/// (spec.md §6 "entry-time intervals").
#[derive(Debug, Clone, Copy)]
pub struct EntryInterval {
    pub start: u64,
    pub end: u64,
}

pub fn parse_entry_intervals(text: &str) -> Result<Vec<EntryInterval>> {
    let mut out = Vec::new();
    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let start: u64 = field(&mut fields, "entry_times", lineno, "interval start")?;
        let end: u64 = field(&mut fields, "entry_times", lineno, "interval end")?;
        out.push(EntryInterval { start, end });
    }
    Ok(out)
}

pub fn frame_is_excised(intervals: &[EntryInterval], frame: u64) -> bool {
    intervals.iter().any(|iv| frame >= iv.start && frame < iv.end)
}

/// Writes the `.barcodes` output file: header (id count, frame count, mfix
/// legend, column description) then one line per frame, grounded on
/// `output.py`'s `barcode_textfile_init`/`barcode_textfile_writeframe`.
pub struct BarcodeTextWriter<W: Write> {
    out: W,
}

impl<W: Write> BarcodeTextWriter<W> {
    pub fn new(mut out: W, num_identities: usize, num_frames: usize) -> Result<Self> {
        writeln!(out, "# number of IDs: {num_identities}")?;
        writeln!(out, "# number of frames: {num_frames}")?;
        write!(out, "# mfix legend:")?;
        for (name, value) in MFix::legend() {
            write!(out, " {name}={value}")?;
        }
        writeln!(out)?;
        writeln!(out, "# fix width format: framenum barcodenum {{strid cx cy xWorld yWorld orientation_deg mfix}} {{...")?;
        writeln!(out)?;
        Ok(Self { out })
    }

    /// Writes one frame. `deleted` mirrors `output.py`'s `deleted` flag:
    /// when false, soft-deleted (but not permanently deleted) barcodes are
    /// skipped too.
    pub fn write_frame(
        &mut self,
        framenum: u64,
        barcodes_by_colorid: &[Vec<Barcode>],
        colorids: &ColoridTable,
        calibration: &Calibration,
        write_deleted: bool,
    ) -> Result<()> {
        let rows: Vec<(usize, &Barcode)> = barcodes_by_colorid
            .iter()
            .enumerate()
            .flat_map(|(k, list)| list.iter().map(move |b| (k, b)))
            .filter(|(_, b)| !b.is_permanently_deleted() && (write_deleted || !b.is_deleted()))
            .collect();

        write!(self.out, "{}\t{}", framenum, rows.len())?;
        for (k, b) in rows {
            let strid: String = colorids.strids[k].iter().filter_map(|&c| colorids.int_to_color(c)).collect();
            let (wx, wy) = calibration.to_world(b.center);
            let degrees = b.orientation.to_degrees();
            write!(self.out, "\t{}\t{:.1}\t{:.1}\t{:.1}\t{:.1}\t{:.1}\t{}", strid, b.center.0, b.center.1, wx, wy, degrees, b.mfix.0)?;
        }
        writeln!(self.out)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes the per-frame unused-blob-index log, grounded on `output.py`'s
/// `logfile_init`/`logfile_writeframe` (the `NUB` line).
pub struct UnusedBlobLogWriter<W: Write> {
    out: W,
}

impl<W: Write> UnusedBlobLogWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        writeln!(out, "# Log file format: frame warningtype params")?;
        writeln!(out, "#   NUB blobcount list_of_blob_indices -- not used blob indices (pointing to .blobs file)")?;
        writeln!(out)?;
        Ok(Self { out })
    }

    pub fn write_frame(&mut self, framenum: u64, unused_blob_indices: &[usize]) -> Result<()> {
        write!(self.out, "{}\tNUB\t{}", framenum, unused_blob_indices.len())?;
        for idx in unused_blob_indices {
            write!(self.out, "\t{idx}")?;
        }
        writeln!(self.out)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colorid_table_with_symbol_section() {
        let text = "R 0\nG 1\nB 2\n\nRGB\nBGR\n";
        let table = parse_colorid_file(text).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.strids[0], vec![0, 1, 2]);
        assert_eq!(table.strids[1], vec![2, 1, 0]);
    }

    #[test]
    fn rejects_colorid_referencing_undeclared_symbol() {
        let text = "R 0\nG 1\n\nRGB\n";
        assert!(parse_colorid_file(text).is_err());
    }

    #[test]
    fn parses_blob_file_frames() {
        let text = "0 2 1\n0 100.0 100.0 5.0\n1 130.0 100.0 5.0\n50.0 50.0 10.0 8.0 0.5\n1 0 0\n";
        let frames = parse_blob_file(text, None).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].color_blobs.len(), 2);
        assert_eq!(frames[0].motion_blobs.len(), 1);
        assert_eq!(frames[1].color_blobs.len(), 0);
    }

    #[test]
    fn max_frames_truncates_read() {
        let text = "0 0 0\n1 0 0\n2 0 0\n";
        let frames = parse_blob_file(text, Some(2)).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn absent_calibration_yields_zero_world_coords() {
        let cal = Calibration::identity_absent();
        assert_eq!(cal.to_world((123.0, 456.0)), (0.0, 0.0));
    }

    #[test]
    fn light_keyframes_resolve_with_last_known_value() {
        let log = parse_light_keyframe_log("0 DAYLIGHT\n100 NIGHTLIGHT\n").unwrap();
        assert_eq!(resolve_light_at(&log, 0), Some(LightCondition::Daylight));
        assert_eq!(resolve_light_at(&log, 50), Some(LightCondition::Daylight));
        assert_eq!(resolve_light_at(&log, 100), Some(LightCondition::Nightlight));
        assert_eq!(resolve_light_at(&log, 1000), Some(LightCondition::Nightlight));
    }

    #[test]
    fn entry_intervals_mark_excised_frames() {
        let intervals = parse_entry_intervals("10 20\n50 60\n").unwrap();
        assert!(frame_is_excised(&intervals, 15));
        assert!(!frame_is_excised(&intervals, 20));
        assert!(!frame_is_excised(&intervals, 30));
    }

    #[test]
    fn barcode_writer_emits_header_and_frame_line() {
        let text = "R 0\nG 1\nB 2\n\nRGB\n";
        let colorids = parse_colorid_file(text).unwrap();
        let mut buf = Vec::new();
        {
            let mut writer = BarcodeTextWriter::new(&mut buf, colorids.len(), 1).unwrap();
            let mut b = Barcode::new(3);
            b.center = (130.0, 100.0);
            b.orientation = std::f64::consts::PI;
            b.mfix.set(MFix::FULLFOUND);
            b.mfix.set(MFix::CHOSEN);
            let frame = vec![vec![b]];
            writer.write_frame(0, &frame, &colorids, &Calibration::identity_absent(), true).unwrap();
            writer.flush().unwrap();
        }
        let output = String::from_utf8(buf).unwrap();
        assert!(output.contains("# number of IDs: 1"));
        assert!(output.contains("RGB"));
        assert!(output.contains("180.0"));
    }
}
