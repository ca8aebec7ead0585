//! Versioned on-disk checkpoints.
//!
//! A checkpoint holds the global tick counter and, for every approximator, its
//! architecture, parameters and Adam state. Files are JSON with shortest
//! round-trip float formatting, so restored parameters are bit-identical.
//! Saves are atomic (write a temp file, then rename).

use crate::error::{EngineError, Result};
use crate::model::Model;
use crate::network::NetworkSnapshot;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CHECKPOINT_FORMAT: &str = "ito-checkpoint";
pub const CHECKPOINT_VERSION: u32 = 1;

const FILE_NAME: &str = "checkpoint.json";
const TEMP_NAME: &str = "checkpoint.tmp.json";

/// Leading fields, read before the body so incompatible files fail clearly.
#[derive(Deserialize)]
struct Header {
    format: String,
    version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format: String,
    pub version: u32,
    pub ticks: u64,
    pub networks: Vec<NetworkSnapshot>,
}

impl Checkpoint {
    pub fn new(ticks: u64, networks: Vec<NetworkSnapshot>) -> Self {
        Self {
            format: CHECKPOINT_FORMAT.to_string(),
            version: CHECKPOINT_VERSION,
            ticks,
            networks,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new("checkpoints")
    }
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    pub fn save(&self, model: &Model) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| EngineError::io("creating checkpoint dir", e))?;
        let checkpoint = model.checkpoint();

        let temp_path = self.dir.join(TEMP_NAME);
        let file = File::create(&temp_path)
            .map_err(|e| EngineError::io("creating temp checkpoint", e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &checkpoint)?;
        writer
            .flush()
            .map_err(|e| EngineError::io("writing checkpoint", e))?;

        let path = self.path();
        fs::rename(&temp_path, &path).map_err(|e| EngineError::io("renaming checkpoint", e))?;
        info!(
            path = %path.display(),
            ticks = checkpoint.ticks,
            networks = checkpoint.networks.len(),
            "Checkpoint saved"
        );
        Ok(path)
    }

    pub fn read(&self) -> Result<Checkpoint> {
        let file = File::open(self.path()).map_err(|e| EngineError::io("opening checkpoint", e))?;
        let mut contents = String::new();
        BufReader::new(file)
            .read_to_string(&mut contents)
            .map_err(|e| EngineError::io("reading checkpoint", e))?;

        let header: Header = serde_json::from_str(&contents)
            .map_err(|e| EngineError::Checkpoint(format!("unreadable checkpoint header: {e}")))?;
        if header.format != CHECKPOINT_FORMAT {
            return Err(EngineError::Checkpoint(format!(
                "unknown checkpoint format '{}', expected '{CHECKPOINT_FORMAT}'",
                header.format
            )));
        }
        if header.version != CHECKPOINT_VERSION {
            return Err(EngineError::Checkpoint(format!(
                "checkpoint version {} is not supported (expected {CHECKPOINT_VERSION})",
                header.version
            )));
        }
        Ok(serde_json::from_str(&contents)?)
    }

    /// Restores the model from the stored checkpoint. Returns the restored tick count.
    pub fn load(&self, model: &mut Model) -> Result<u64> {
        let checkpoint = self.read()?;
        model.restore(&checkpoint)?;
        info!(
            path = %self.path().display(),
            ticks = checkpoint.ticks,
            "Checkpoint loaded"
        );
        Ok(checkpoint.ticks)
    }
}
