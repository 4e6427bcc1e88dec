//! Track history and log export.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::{Result, VideoError};

/// Warp gradient value for positions outside the precomputed map.
pub const UNKNOWN_WGM: f32 = -1.0;

pub const INTERPOLATED_NOTE: &str = "interpolated";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackEntry {
    /// Ground-plane pixel position.
    pub position: Point2<f32>,
    pub orientation_rad: f32,
    /// NCC score of the appearance match.
    pub error: f32,
    pub timestamp_ms: u64,
    pub warp_gradient_magnitude: f32,
    #[serde(default)]
    pub note: Option<String>,
}

impl TrackEntry {
    pub fn new(position: Point2<f32>, orientation_rad: f32, error: f32, timestamp_ms: u64) -> Self {
        Self {
            position,
            orientation_rad,
            error,
            timestamp_ms,
            warp_gradient_magnitude: UNKNOWN_WGM,
            note: None,
        }
    }

    pub fn with_warp_gradient(mut self, wgm: f32) -> Self {
        self.warp_gradient_magnitude = wgm;
        self
    }
}

/// Chronological track. Only [`TrackHistory::rewind`] removes entries and
/// only [`TrackHistory::interpolate`] inserts between existing ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackHistory {
    entries: Vec<TrackEntry>,
}

impl TrackHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TrackEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TrackEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TrackEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry newer than `timestamp_ms`, returning how many went.
    pub fn rewind(&mut self, timestamp_ms: u64) -> usize {
        let keep = self
            .entries
            .iter()
            .position(|e| e.timestamp_ms > timestamp_ms)
            .unwrap_or(self.entries.len());
        let removed = self.entries.len() - keep;
        self.entries.truncate(keep);
        removed
    }

    /// Fill gaps longer than `max_gap_ms` with evenly spaced synthetic
    /// entries. Returns the number of entries inserted.
    pub fn interpolate(&mut self, max_gap_ms: u64) -> usize {
        if max_gap_ms == 0 || self.entries.len() < 2 {
            return 0;
        }
        let mut out = Vec::with_capacity(self.entries.len());
        let mut inserted = 0;
        for pair in self.entries.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            out.push(a.clone());
            let gap = b.timestamp_ms.saturating_sub(a.timestamp_ms);
            if gap <= max_gap_ms {
                continue;
            }
            let steps = gap.div_ceil(max_gap_ms);
            let turn = wrap_angle(b.orientation_rad - a.orientation_rad);
            for k in 1..steps {
                let f = k as f32 / steps as f32;
                out.push(TrackEntry {
                    position: a.position + (b.position - a.position) * f,
                    orientation_rad: wrap_angle(a.orientation_rad + turn * f),
                    error: 0.0,
                    timestamp_ms: a.timestamp_ms + gap * k / steps,
                    warp_gradient_magnitude: UNKNOWN_WGM,
                    note: Some(INTERPOLATED_NOTE.to_string()),
                });
                inserted += 1;
            }
        }
        if let Some(last) = self.entries.last() {
            out.push(last.clone());
        }
        self.entries = out;
        inserted
    }
}

/// Angle in `(-pi, pi]`.
pub fn wrap_angle(a: f32) -> f32 {
    use std::f32::consts::{PI, TAU};
    let mut a = a % TAU;
    if a > PI {
        a -= TAU;
    } else if a <= -PI {
        a += TAU;
    }
    a
}

fn check_scale(px_per_cm: f64) -> Result<()> {
    if !px_per_cm.is_finite() || px_per_cm <= 0.0 {
        return Err(VideoError::InvalidParameters(format!(
            "pixel scale must be positive, got {px_per_cm}"
        )));
    }
    Ok(())
}

/// Entry in log units: seconds, centimetres with y pointing up, degrees
/// counter-clockwise.
fn log_units(e: &TrackEntry, px_per_cm: f64) -> (f64, f64, f64, f64) {
    (
        e.timestamp_ms as f64 / 1000.0,
        e.position.x as f64 / px_per_cm,
        -(e.position.y as f64) / px_per_cm,
        -(e.orientation_rad as f64).to_degrees(),
    )
}

/// Plain text track log.
pub fn write_log<W: Write>(mut writer: W, history: &TrackHistory, px_per_cm: f64) -> Result<()> {
    check_scale(px_per_cm)?;
    writeln!(
        writer,
        "# Track log generated {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    for e in history.entries() {
        let (t, x, y, h) = log_units(e, px_per_cm);
        match &e.note {
            Some(note) => writeln!(writer, "{t:.3} {x:.2} {y:.2} {h:.2} {note}")?,
            None => writeln!(
                writer,
                "  {t:.3}  {x:.2} {y:.2} {h:.2} {:.4} {:.4}",
                e.error, e.warp_gradient_magnitude
            )?,
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_csv<W: Write>(mut writer: W, history: &TrackHistory, px_per_cm: f64) -> Result<()> {
    check_scale(px_per_cm)?;
    writeln!(writer, "Time(s),X(cm),Y(cm),H(deg),Err,WGM")?;
    for e in history.entries() {
        let (t, x, y, h) = log_units(e, px_per_cm);
        writeln!(
            writer,
            "{t:.3},{x:.2},{y:.2},{h:.2},{:.4},{:.4}",
            e.error, e.warp_gradient_magnitude
        )?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_log(path: impl AsRef<Path>, history: &TrackHistory, px_per_cm: f64) -> Result<()> {
    let file = File::create(path.as_ref())?;
    write_log(BufWriter::new(file), history, px_per_cm)?;
    tracing::info!(path = %path.as_ref().display(), entries = history.len(), "track log saved");
    Ok(())
}

pub fn save_csv(path: impl AsRef<Path>, history: &TrackHistory, px_per_cm: f64) -> Result<()> {
    let file = File::create(path.as_ref())?;
    write_csv(BufWriter::new(file), history, px_per_cm)?;
    tracing::info!(path = %path.as_ref().display(), entries = history.len(), "track csv saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history() -> TrackHistory {
        let mut h = TrackHistory::new();
        h.push(TrackEntry::new(Point2::new(20.0, 10.0), 0.5, 0.9, 1000).with_warp_gradient(1.25));
        h.push(TrackEntry::new(Point2::new(30.0, 10.0), 0.5, 0.8, 1040));
        h.push(TrackEntry::new(Point2::new(30.0, 50.0), -0.3, 0.85, 1400));
        h
    }

    #[test]
    fn rewind_drops_newer_entries() {
        let mut h = history();
        assert_eq!(h.rewind(1040), 1);
        assert_eq!(h.last().map(|e| e.timestamp_ms), Some(1040));
        assert_eq!(h.rewind(0), 2);
        assert!(h.is_empty());
    }

    #[test]
    fn interpolation_fills_long_gaps_only() {
        let mut h = history();
        let before: Vec<TrackEntry> = h.entries().to_vec();
        // 360 ms gap with a 100 ms limit gets 3 synthetic entries
        assert_eq!(h.interpolate(100), 3);
        assert_eq!(h.len(), 6);
        let originals: Vec<&TrackEntry> = h.entries().iter().filter(|e| e.note.is_none()).collect();
        assert_eq!(originals.len(), 3);
        for (a, b) in originals.iter().zip(&before) {
            assert_eq!(*a, b);
        }
        let mid = &h.entries()[2];
        assert_eq!(mid.note.as_deref(), Some(INTERPOLATED_NOTE));
        assert_eq!(mid.timestamp_ms, 1130);
        assert!((mid.position.y - 20.0).abs() < 1e-4);
        assert!(h.entries().windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
    }

    #[test]
    fn log_negates_y_and_heading() {
        let mut h = history();
        h.interpolate(200);
        let mut buf = Vec::new();
        write_log(&mut buf, &h, 2.0).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# Track log generated "));
        assert_eq!(lines[1], "  1.000  10.00 -5.00 -28.65 0.9000 1.2500");
        assert_eq!(lines[2], "  1.040  15.00 -5.00 -28.65 0.8000 -1.0000");
        assert_eq!(lines[3], "1.220 15.00 -15.00 -5.73 interpolated");
    }

    #[test]
    fn csv_has_header_and_rows() {
        let mut buf = Vec::new();
        write_csv(&mut buf, &history(), 1.0).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Time(s),X(cm),Y(cm),H(deg),Err,WGM");
        assert_eq!(lines[3], "1.400,30.00,-50.00,17.19,0.8500,-1.0000");
        assert!(write_csv(Vec::new(), &history(), 0.0).is_err());
    }

    #[test]
    fn wraps_angles() {
        assert!((wrap_angle(3.0 * std::f32::consts::PI) - std::f32::consts::PI).abs() < 1e-5);
        assert!((wrap_angle(-0.25) + 0.25).abs() < 1e-6);
    }
}
