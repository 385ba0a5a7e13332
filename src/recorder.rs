//! Persistence of completed acquisitions.
//!
//! Each acquisition becomes one headerless little-endian file,
//! `acq_001.bin`, `acq_002.bin`, ..., holding every channel A sample followed
//! by every channel B sample. Stopping a recording writes `metadata.txt`
//! next to them.

use crate::{ChannelId, EngineError};
use half::f16;
use log::{info, warn};
use ndarray::{Array2, ArrayView1};
use serde::Deserialize;
use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// One decoded capture of both channels, in volts.
#[derive(Clone, Debug)]
pub struct Acquisition {
    pub sequence: u64,
    pub interval_ns: f64,
    pub triggered: bool,
    /// Row 0 is channel A, row 1 is channel B. A disabled channel is NaN.
    pub samples: Array2<f32>,
}

impl Acquisition {
    /// Builds a `2 x len` acquisition. Missing rows and short rows are
    /// padded with NaN.
    pub fn from_rows(
        sequence: u64,
        interval_ns: f64,
        triggered: bool,
        len: usize,
        rows: [Option<Vec<f32>>; 2],
    ) -> Self {
        let samples = Array2::from_shape_fn((2, len), |(ch, i)| {
            rows[ch]
                .as_ref()
                .and_then(|row| row.get(i).copied())
                .unwrap_or(f32::NAN)
        });
        Self {
            sequence,
            interval_ns,
            triggered,
            samples,
        }
    }

    pub fn channel(&self, channel: ChannelId) -> ArrayView1<'_, f32> {
        self.samples.row(channel.index())
    }
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    #[default]
    F16,
    /// Files written before half precision became the default.
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::F16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

pub fn write_acquisition(
    path: &Path,
    acquisition: &Acquisition,
    format: SampleFormat,
) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    // standard layout iterates row by row: all of A, then all of B
    for &v in acquisition.samples.iter() {
        match format {
            SampleFormat::F16 => out.write_all(&f16::from_f32(v).to_le_bytes())?,
            SampleFormat::F32 => out.write_all(&v.to_le_bytes())?,
        }
    }
    out.flush()
}

/// Reads an acquisition file back as `(channel A, channel B)`.
pub fn read_acquisition(
    path: &Path,
    format: SampleFormat,
) -> Result<(Vec<f32>, Vec<f32>), EngineError> {
    let bytes = fs::read(path)?;
    let width = format.bytes_per_sample();
    if bytes.len() % width != 0 {
        return Err(EngineError::Format(format!(
            "{} is {} bytes, not a whole number of {width}-byte samples",
            path.display(),
            bytes.len()
        )));
    }
    let values: Vec<f32> = match format {
        SampleFormat::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        SampleFormat::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    };
    if values.len() % 2 != 0 {
        return Err(EngineError::Format(format!(
            "{} holds {} values; expected an even count",
            path.display(),
            values.len()
        )));
    }
    let mut a = values;
    let b = a.split_off(a.len() / 2);
    Ok((a, b))
}

#[derive(Debug)]
struct RecordingSession {
    directory: PathBuf,
    next_sequence: u64,
    started_at: OffsetDateTime,
    sampling_frequency_hz: f64,
    frame_rate_hz: f64,
    acquisitions_saved: u64,
}

/// What a finished recording left on disk.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordingSummary {
    pub directory: PathBuf,
    pub acquisitions_saved: u64,
    pub metadata: PathBuf,
}

#[derive(Debug, Default)]
pub struct Recorder {
    format: SampleFormat,
    session: Option<RecordingSession>,
}

impl Recorder {
    pub fn new(format: SampleFormat) -> Self {
        Self {
            format,
            session: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn acquisitions_saved(&self) -> u64 {
        self.session.as_ref().map_or(0, |s| s.acquisitions_saved)
    }

    /// Begins a recording into `directory`, creating it if needed.
    /// On failure nothing changes.
    pub fn start(
        &mut self,
        directory: &Path,
        sampling_frequency_hz: f64,
        frame_rate_hz: f64,
    ) -> Result<(), EngineError> {
        if self.session.is_some() {
            return Err(EngineError::InvalidConfig(
                "a recording is already in progress".into(),
            ));
        }
        check_writable(directory)?;
        info!("recording to {}", directory.display());
        self.session = Some(RecordingSession {
            directory: directory.to_path_buf(),
            next_sequence: 1,
            started_at: OffsetDateTime::now_utc(),
            sampling_frequency_hz,
            frame_rate_hz,
            acquisitions_saved: 0,
        });
        Ok(())
    }

    /// Writes `acquisition` as the next numbered file. Returns `None` when
    /// not recording.
    pub fn record(&mut self, acquisition: &Acquisition) -> Result<Option<PathBuf>, EngineError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(None);
        };
        let path = session
            .directory
            .join(format!("acq_{:03}.bin", session.next_sequence));
        write_acquisition(&path, acquisition, self.format)?;
        session.next_sequence += 1;
        session.acquisitions_saved += 1;
        Ok(Some(path))
    }

    /// Ends the recording and writes its metadata. The recorder is idle
    /// afterwards even if the metadata could not be written.
    pub fn stop(&mut self) -> Result<Option<RecordingSummary>, EngineError> {
        let Some(session) = self.session.take() else {
            return Ok(None);
        };
        let metadata = session.directory.join("metadata.txt");
        write_metadata(&metadata, &session).inspect_err(|e| {
            warn!("could not write {}: {e}", metadata.display());
        })?;
        info!(
            "recording stopped: {} acquisitions in {}",
            session.acquisitions_saved,
            session.directory.display()
        );
        Ok(Some(RecordingSummary {
            directory: session.directory,
            acquisitions_saved: session.acquisitions_saved,
            metadata,
        }))
    }
}

fn check_writable(directory: &Path) -> Result<(), EngineError> {
    let unwritable = |source| EngineError::DestinationUnwritable {
        path: directory.to_path_buf(),
        source,
    };
    fs::create_dir_all(directory).map_err(unwritable)?;
    let probe = directory.join(".write_probe");
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(unwritable)?;
    fs::remove_file(&probe).map_err(unwritable)
}

fn write_metadata(path: &Path, session: &RecordingSession) -> Result<(), EngineError> {
    let started_at = session
        .started_at
        .format(&Rfc3339)
        .map_err(|e| EngineError::Format(e.to_string()))?;
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "started_at={started_at}")?;
    writeln!(out, "sampling_frequency_hz={}", session.sampling_frequency_hz)?;
    writeln!(out, "frame_rate_hz={}", session.frame_rate_hz)?;
    writeln!(out, "acquisitions_saved={}", session.acquisitions_saved)?;
    out.flush()?;
    Ok(())
}
