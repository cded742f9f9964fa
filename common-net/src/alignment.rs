//! Command/media alignment log.
//!
//! Every received command is logged together with the media position at
//! the moment it arrived, so a reader can tell which command was in effect
//! for any recorded frame. The media position is the number of frames seen
//! so far (last observed sequence + 1): a command logged at position N takes
//! effect from frame N onwards.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Micros;
use crate::message::{ControlBody, ControlKind, ControlMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    pub received_at: Micros,
    pub media_sequence_at_receipt: u64,
    pub command: ControlMessage,
}

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("command log io: {0}")]
    Io(#[from] io::Error),
    #[error("command log encoding: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("command log line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("{kind} is not a loggable command")]
    NotACommand { kind: ControlKind },
}

/// Append-only persistence for log entries.
pub trait CommandSink {
    fn append_entry(&mut self, entry: &CommandLogEntry) -> Result<(), AlignmentError>;
    fn flush(&mut self) -> Result<(), AlignmentError>;
}

/// One JSON object per line.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Append to `path`, creating it and its parent directories if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AlignmentError> {
        Self::with_options(path.as_ref(), OpenOptions::new().create(true).append(true))
    }

    /// Start a fresh log at `path`, discarding any previous content.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, AlignmentError> {
        Self::with_options(
            path.as_ref(),
            OpenOptions::new().create(true).write(true).truncate(true),
        )
    }

    fn with_options(path: &Path, options: &OpenOptions) -> Result<Self, AlignmentError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = options.open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandSink for JsonlSink {
    fn append_entry(&mut self, entry: &CommandLogEntry) -> Result<(), AlignmentError> {
        serde_json::to_writer(&mut self.writer, entry)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AlignmentError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub entries: Vec<CommandLogEntry>,
    pub flushes: usize,
}

impl CommandSink for MemorySink {
    fn append_entry(&mut self, entry: &CommandLogEntry) -> Result<(), AlignmentError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AlignmentError> {
        self.flushes += 1;
        Ok(())
    }
}

pub struct AlignmentLog<S> {
    entries: Vec<CommandLogEntry>,
    persisted: usize,
    sink: S,
}

impl<S: CommandSink> AlignmentLog<S> {
    pub fn new(sink: S) -> Self {
        Self {
            entries: Vec::new(),
            persisted: 0,
            sink,
        }
    }

    /// Log one received command. Timestamps and media positions that would
    /// go backwards are clamped to the previous entry's values so both
    /// columns stay non-decreasing.
    pub fn append(
        &mut self,
        command: ControlMessage,
        current_media_sequence: u64,
        received_at: Micros,
    ) -> Result<&CommandLogEntry, AlignmentError> {
        let kind = command.kind();
        if !kind.is_command() {
            return Err(AlignmentError::NotACommand { kind });
        }

        let (received_at, media_sequence_at_receipt) = match self.entries.last() {
            Some(last) => (
                received_at.max(last.received_at),
                current_media_sequence.max(last.media_sequence_at_receipt),
            ),
            None => (received_at, current_media_sequence),
        };
        self.entries.push(CommandLogEntry {
            received_at,
            media_sequence_at_receipt,
            command,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    /// Persist entries appended since the previous flush. Returns how many
    /// were written. After a sink error the entries already handed to the
    /// sink are not written again.
    pub fn flush(&mut self) -> Result<usize, AlignmentError> {
        let start = self.persisted;
        while let Some(entry) = self.entries.get(self.persisted) {
            self.sink.append_entry(entry)?;
            self.persisted += 1;
        }
        self.sink.flush()?;
        Ok(self.persisted - start)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S> AlignmentLog<S> {
    pub fn entries(&self) -> &[CommandLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn command_at(&self, frame: u64) -> Option<&CommandLogEntry> {
        command_at(&self.entries, frame)
    }

    pub fn replay_state_at(&self, frame: u64) -> ReplayState {
        replay_state_at(&self.entries, frame)
    }
}

/// Playback state reconstructed for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayState {
    pub playing: bool,
    pub overlay_text: String,
    pub last_command: Option<ControlKind>,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self {
            playing: true,
            overlay_text: String::new(),
            last_command: None,
        }
    }
}

/// Latest command in effect for `frame`, found by binary search.
pub fn command_at(entries: &[CommandLogEntry], frame: u64) -> Option<&CommandLogEntry> {
    let end = entries.partition_point(|entry| entry.media_sequence_at_receipt <= frame);
    end.checked_sub(1).map(|index| &entries[index])
}

pub fn replay_state_at(entries: &[CommandLogEntry], frame: u64) -> ReplayState {
    let end = entries.partition_point(|entry| entry.media_sequence_at_receipt <= frame);
    let mut state = ReplayState::default();
    for entry in &entries[..end] {
        match entry.command.body() {
            ControlBody::Play => state.playing = true,
            ControlBody::Pause => state.playing = false,
            ControlBody::Text { message } => state.overlay_text = message.clone(),
            _ => continue,
        }
        state.last_command = Some(entry.command.kind());
    }
    state
}

/// Load a persisted log, rejecting lines that break the ordering guarantee.
pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<CommandLogEntry>, AlignmentError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries: Vec<CommandLogEntry> = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let corrupt = |reason: String| AlignmentError::Corrupt {
            line: index + 1,
            reason,
        };
        let entry: CommandLogEntry =
            serde_json::from_str(&line).map_err(|err| corrupt(err.to_string()))?;
        if let Some(previous) = entries.last() {
            if entry.media_sequence_at_receipt < previous.media_sequence_at_receipt
                || entry.received_at < previous.received_at
            {
                return Err(corrupt("entry goes back in time".into()));
            }
        }
        entries.push(entry);
    }

    Ok(entries)
}

/// Media position shared between a media consumer and the command path.
#[derive(Debug, Default)]
pub struct MediaCursor {
    next: AtomicU64,
}

impl MediaCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `sequence` was observed. Late, out-of-order units never
    /// move the position backwards.
    pub fn observe(&self, sequence: u64) {
        self.next
            .fetch_max(sequence.saturating_add(1), Ordering::AcqRel);
    }

    /// Frames observed so far, i.e. the sequence the next frame will carry.
    pub fn position(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}
