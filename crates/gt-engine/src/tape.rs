//! Append-only trial tape.
//!
//! The tape is the durable record of every `suggest`/`submit` action. On disk
//! it is a JSON-lines file whose first record is the run metadata; every
//! following line is one [`TapeEntry`]. Each append writes a single complete
//! line and syncs it, so a crash can at worst leave a torn final line, which
//! [`Tape::restore`] drops.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use gt_types::{EvalResult, GtResult, RunMeta, Suggestion, TapeError, Tid};

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TapeEntry {
    Suggest { tid: Tid, suggestion: Suggestion },
    Submit { tid: Tid, result: EvalResult },
}

impl TapeEntry {
    pub fn tid(&self) -> Tid {
        match self {
            Self::Suggest { tid, .. } | Self::Submit { tid, .. } => *tid,
        }
    }
}

/// On-disk line format: metadata or an entry.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    Meta(RunMeta),
    Suggest { tid: Tid, suggestion: Suggestion },
    Submit { tid: Tid, result: EvalResult },
}

impl From<TapeEntry> for Record {
    fn from(entry: TapeEntry) -> Self {
        match entry {
            TapeEntry::Suggest { tid, suggestion } => Self::Suggest { tid, suggestion },
            TapeEntry::Submit { tid, result } => Self::Submit { tid, result },
        }
    }
}

/// A tape read back from disk.
#[derive(Debug, Clone)]
pub struct RecordedTape {
    pub meta: RunMeta,
    pub entries: Vec<TapeEntry>,
    /// Whether a torn trailing line was discarded.
    pub dropped_tail: bool,
}

#[derive(Debug)]
struct TapeFile {
    path: PathBuf,
    file: File,
}

/// The live tape a `State` writes to.
#[derive(Debug)]
pub struct Tape {
    entries: Vec<TapeEntry>,
    sink: Option<TapeFile>,
}

impl Tape {
    /// Ephemeral tape, used when inspecting results.
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            sink: None,
        }
    }

    /// Create (or truncate) a tape file and write the metadata record.
    pub fn create<P: AsRef<Path>>(path: P, meta: &RunMeta) -> GtResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut tape = Self {
            entries: Vec::new(),
            sink: Some(TapeFile { path, file }),
        };
        tape.write_record(&Record::Meta(meta.clone()))?;
        Ok(tape)
    }

    /// Record one entry. Persisted tapes sync the line before returning.
    pub fn append(&mut self, entry: TapeEntry) -> GtResult<()> {
        if self.sink.is_some() {
            self.write_record(&Record::from(entry.clone()))?;
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[TapeEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &TapeEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|sink| sink.path.as_path())
    }

    /// Move the backing file; writes keep going to the same open handle.
    pub fn rename_to<P: AsRef<Path>>(&mut self, path: P) -> GtResult<()> {
        if let Some(sink) = self.sink.as_mut() {
            let target = path.as_ref().to_path_buf();
            fs::rename(&sink.path, &target)?;
            sink.path = target;
        }
        Ok(())
    }

    fn write_record(&mut self, record: &Record) -> GtResult<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        sink.file.write_all(&line)?;
        sink.file.sync_data()?;
        Ok(())
    }

    /// Read a persisted tape from the beginning.
    pub fn restore<P: AsRef<Path>>(path: P) -> GtResult<RecordedTape> {
        let path = path.as_ref();
        let shown = path.display().to_string();
        if !path.exists() {
            return Err(TapeError::NotFound { path: shown }.into());
        }
        let content = fs::read_to_string(path)?;

        let mut lines: Vec<&str> = content.split('\n').collect();
        if content.ends_with('\n') {
            lines.pop();
        }
        let last = lines.len().saturating_sub(1);

        let mut meta = None;
        let mut entries = Vec::new();
        let mut dropped_tail = false;

        for (index, line) in lines.iter().enumerate() {
            let number = index + 1;
            let record: Record = match serde_json::from_str(line) {
                Ok(record) => record,
                Err(e) if index == last && index > 0 => {
                    warn!(path = %shown, line = number, error = %e, "dropping torn trailing tape record");
                    dropped_tail = true;
                    break;
                }
                Err(e) if index == 0 => {
                    return Err(TapeError::MissingMetadata {
                        path: format!("{shown} ({e})"),
                    }
                    .into())
                }
                Err(e) => {
                    return Err(TapeError::Corrupted {
                        path: shown,
                        line: number,
                        message: e.to_string(),
                    }
                    .into())
                }
            };

            match (index, record) {
                (0, Record::Meta(m)) => meta = Some(m),
                (0, _) => return Err(TapeError::MissingMetadata { path: shown }.into()),
                (_, Record::Meta(_)) => {
                    return Err(TapeError::UnexpectedMetadata {
                        path: shown,
                        line: number,
                    }
                    .into())
                }
                (_, Record::Suggest { tid, suggestion }) => {
                    entries.push(TapeEntry::Suggest { tid, suggestion })
                }
                (_, Record::Submit { tid, result }) => {
                    entries.push(TapeEntry::Submit { tid, result })
                }
            }
        }

        let meta = meta.ok_or(TapeError::MissingMetadata { path: shown })?;
        debug!(path = %path.display(), entries = entries.len(), "tape restored");
        Ok(RecordedTape {
            meta,
            entries,
            dropped_tail,
        })
    }
}
