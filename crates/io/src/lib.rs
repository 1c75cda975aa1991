use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::{fs::File, path::Path};
use serde::{Serialize, Deserialize};
use bytes::Bytes;
use model::{Coordinate, Detection};
use pathcue_core::{Camera, CameraFactory, Detector, Frame};

/// One recorded detector output.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DetectionFrame {
    pub frame: u64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

pub fn load_detection_script(path: &Path) -> Result<Vec<DetectionFrame>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    read_detection_script(BufReader::new(f))
}

/// NDJSON, one `DetectionFrame` per line. Blank lines are skipped.
pub fn read_detection_script<R: BufRead>(rdr: R) -> Result<Vec<DetectionFrame>> {
    let mut frames = vec![];
    for (n, line) in rdr.lines().enumerate() {
        let s = line?;
        if s.trim().is_empty() { continue; }
        let f: DetectionFrame = serde_json::from_str(&s)
            .with_context(|| format!("detection script line {}", n + 1))?;
        frames.push(f);
    }
    Ok(frames)
}

/// Replays recorded detections. Frames are matched by index modulo the
/// script length, so a short recording loops.
pub struct ReplayDetector {
    frames: Vec<Vec<Detection>>,
}

impl ReplayDetector {
    pub fn new(mut script: Vec<DetectionFrame>) -> Self {
        script.sort_by_key(|f| f.frame);
        Self { frames: script.into_iter().map(|f| f.detections).collect() }
    }

    /// Detects nothing, ever.
    pub fn empty() -> Self {
        Self { frames: vec![] }
    }
}

impl Detector for ReplayDetector {
    fn detect(&self, frame: &Frame) -> Vec<Detection> {
        if self.frames.is_empty() { return vec![]; }
        let i = (frame.index % self.frames.len() as u64) as usize;
        self.frames[i].clone()
    }
}

/// Stand-in capture device. Each frame's payload is a small header holding
/// the frame index, little endian.
pub struct SyntheticCamera {
    next: u64,
}

pub const SYNTHETIC_MAGIC: &[u8; 4] = b"PCSF";

impl Camera for SyntheticCamera {
    fn is_opened(&self) -> bool { true }

    fn read(&mut self) -> Option<Frame> {
        let mut header = Vec::with_capacity(12);
        header.extend_from_slice(SYNTHETIC_MAGIC);
        header.extend_from_slice(&self.next.to_le_bytes());
        let frame = Frame { index: self.next, data: Bytes::from(header) };
        self.next += 1;
        Some(frame)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyntheticCameraFactory;

impl CameraFactory for SyntheticCameraFactory {
    fn open(&self) -> Box<dyn Camera> {
        Box::new(SyntheticCamera { next: 0 })
    }
}

/// A recorded position fix, `t_ms` relative to the start of the trace.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TraceFix {
    pub t_ms: u64,
    pub lat: f64,
    pub lng: f64,
}

impl TraceFix {
    pub fn coordinate(&self) -> Coordinate { Coordinate::new(self.lat, self.lng) }
}

pub fn import_position_trace(path: &Path) -> Result<Vec<TraceFix>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    read_position_trace(f)
}

/// CSV with a `t_ms,lat,lng` header. Fixes come back ordered by time.
pub fn read_position_trace<R: Read>(rdr: R) -> Result<Vec<TraceFix>> {
    let mut rdr = csv::Reader::from_reader(rdr);
    let mut fixes = Vec::<TraceFix>::new();
    for rec in rdr.deserialize() {
        let r: TraceFix = rec?;
        fixes.push(r);
    }
    fixes.sort_by_key(|f| f.t_ms);
    Ok(fixes)
}

/// Group detection script frames by label, for quick summaries.
pub fn label_counts(script: &[DetectionFrame]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for f in script {
        for d in &f.detections {
            *counts.entry(d.class_label.clone()).or_insert(0) += 1;
        }
    }
    counts
}

pub fn write_ndjson<W: Write, T: Serialize>(w: &mut W, value: &T) -> Result<()> {
    let s = serde_json::to_string(value)?;
    writeln!(w, "{}", s)?;
    w.flush()?;
    Ok(())
}
