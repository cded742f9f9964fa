use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use common_net::{
    alignment::{AlignmentError, AlignmentLog, CommandLogEntry, JsonlSink, MediaCursor},
    clock::{Clock, Micros},
    media::{recv_latest, MediaUnit},
    message::ControlMessage,
    shutdown::ShutdownReceiver,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const COMMANDS_FILE: &str = "commands.jsonl";
pub const UNITS_FILE: &str = "recording.units";

/// Largest unit record accepted when reading a recording back.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("recording io: {0}")]
    Io(#[from] io::Error),
    #[error("recording codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Alignment(#[from] AlignmentError),
    #[error("unit record {index}: {reason}")]
    Corrupt { index: u64, reason: String },
}

/// Logs commands seen on the control channel against the media position
/// published by the media side. Every entry is flushed as soon as it is
/// appended so an abrupt stop loses nothing.
pub struct CommandRecorder {
    log: AlignmentLog<JsonlSink>,
    cursor: Arc<MediaCursor>,
    clock: Arc<dyn Clock>,
}

impl CommandRecorder {
    pub fn create(
        path: impl AsRef<Path>,
        cursor: Arc<MediaCursor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RecordingError> {
        Ok(Self {
            log: AlignmentLog::new(JsonlSink::create(path)?),
            cursor,
            clock,
        })
    }

    /// Log `message` if it is a command. Other kinds are ignored.
    pub fn record(&mut self, message: &ControlMessage) -> Result<Option<&CommandLogEntry>, RecordingError> {
        if !message.kind().is_command() {
            return Ok(None);
        }
        let received_at = self.clock.now_micros();
        self.log
            .append(message.clone(), self.cursor.position(), received_at)?;
        self.log.flush()?;
        Ok(self.log.entries().last())
    }

    pub fn entries(&self) -> &[CommandLogEntry] {
        self.log.entries()
    }

    pub fn path(&self) -> &Path {
        self.log.sink().path()
    }
}

#[derive(Serialize, Deserialize)]
struct UnitRecord {
    sequence: u64,
    capture_timestamp: Micros,
    arrival_timestamp: Option<Micros>,
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

impl From<&MediaUnit> for UnitRecord {
    fn from(unit: &MediaUnit) -> Self {
        Self {
            sequence: unit.sequence,
            capture_timestamp: unit.capture_timestamp,
            arrival_timestamp: unit.arrival_timestamp,
            payload: unit.payload.clone(),
        }
    }
}

impl From<UnitRecord> for MediaUnit {
    fn from(record: UnitRecord) -> Self {
        let unit = MediaUnit::new(record.sequence, record.capture_timestamp, record.payload);
        match record.arrival_timestamp {
            Some(arrival) => unit.arrived_at(arrival),
            None => unit,
        }
    }
}

/// Writes received units to disk as big-endian u32 length-prefixed bincode
/// records, arrival stamps included, and advances the shared media cursor.
pub struct MediaRecorder {
    path: PathBuf,
    writer: BufWriter<File>,
    cursor: Arc<MediaCursor>,
    units: u64,
}

impl MediaRecorder {
    pub fn create(path: impl AsRef<Path>, cursor: Arc<MediaCursor>) -> Result<Self, RecordingError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            writer: BufWriter::new(File::create(&path)?),
            path,
            cursor,
            units: 0,
        })
    }

    pub fn write(&mut self, unit: &MediaUnit) -> Result<(), RecordingError> {
        let record = bincode::serialize(&UnitRecord::from(unit))?;
        let len = u32::try_from(record.len()).map_err(|_| RecordingError::Corrupt {
            index: self.units,
            reason: format!("{} bytes does not fit a record", record.len()),
        })?;
        self.writer.write_all(&len.to_be_bytes())?;
        self.writer.write_all(&record)?;
        self.cursor.observe(unit.sequence);
        self.units += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RecordingError> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What the media side recorded before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaStats {
    pub units: u64,
    pub dropped: u64,
}

/// Record units until `stop_rx` fires or the queue closes. Units lost to a
/// slow disk are counted, not waited for.
pub async fn record_media(
    mut units: broadcast::Receiver<MediaUnit>,
    mut recorder: MediaRecorder,
    mut stop_rx: ShutdownReceiver,
) -> Result<MediaStats, RecordingError> {
    let mut dropped = 0u64;
    loop {
        let received = tokio::select! {
            _ = stop_rx.changed() => break,
            received = recv_latest(&mut units) => received,
        };
        let Some(received) = received else {
            debug!("media queue closed");
            break;
        };
        if received.dropped > 0 {
            warn!(dropped = received.dropped, "recorder fell behind, units lost");
            dropped += received.dropped;
        }
        recorder.write(&received.unit)?;
        if recorder.units() == 1 {
            info!(path = %recorder.path().display(), "first media unit recorded");
        }
        recorder.flush()?;
    }

    recorder.flush()?;
    Ok(MediaStats {
        units: recorder.units(),
        dropped,
    })
}

/// Load every unit from a recording written by `MediaRecorder`.
pub fn read_units(path: impl AsRef<Path>) -> Result<Vec<MediaUnit>, RecordingError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut units = Vec::new();

    loop {
        let index = units.len() as u64;
        let mut len = [0u8; 4];
        match reader.read_exact(&mut len) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_RECORD_LEN {
            return Err(RecordingError::Corrupt {
                index,
                reason: format!("record length {len} exceeds limit"),
            });
        }

        let mut record = vec![0u8; len];
        reader.read_exact(&mut record).map_err(|err| match err.kind() {
            ErrorKind::UnexpectedEof => RecordingError::Corrupt {
                index,
                reason: "truncated record".into(),
            },
            _ => err.into(),
        })?;
        let record: UnitRecord = bincode::deserialize(&record)?;
        units.push(record.into());
    }

    Ok(units)
}
