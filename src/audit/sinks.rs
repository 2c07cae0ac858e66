// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Audit sink implementations.
//!
//! - [`LogAuditSink`]: one `tracing` record per event (target `audit`)
//! - [`FileAuditSink`]: JSON lines with size-based rotation
//! - [`MemoryAuditSink`]: keeps events in memory
//! - [`MultiAuditSink`]: fans out to several sinks

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{AuditEvent, AuditLevel, AuditSink};
use crate::error::{GatewayError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writes each event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn log_event(&self, event: &AuditEvent) {
        let line = event.to_json();
        match event.level() {
            AuditLevel::Info => tracing::info!(target: "audit", "{}", line),
            AuditLevel::Warn => tracing::warn!(target: "audit", "{}", line),
            AuditLevel::Error => tracing::error!(target: "audit", "{}", line),
        }
    }
}

/// Appends events as JSON lines to a file, rotating by size.
///
/// Rotated files are named `<path>.1` (newest) to `<path>.<max_files>`. At
/// least one rotated file is always kept. If rotation fails, records keep
/// going to the active file and rotation is retried on the next append.
pub struct FileAuditSink {
    path: PathBuf,
    max_size_bytes: u64,
    max_files: u32,
    writer: Mutex<FileState>,
}

struct FileState {
    writer: BufWriter<File>,
    current_size: u64,
}

impl FileAuditSink {
    /// Default rotation size: 10 MB.
    pub const DEFAULT_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;

    /// Default number of rotated files kept.
    pub const DEFAULT_MAX_FILES: u32 = 5;

    /// Open (or create) the audit file at `path`.
    pub fn new(path: impl Into<PathBuf>, max_size_bytes: u64, max_files: u32) -> Result<Self> {
        let path = path.into();
        if max_size_bytes == 0 || max_files == 0 {
            return Err(GatewayError::config(format!(
                "audit file {} needs a non-zero rotation size and file count",
                path.display()
            )));
        }
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            max_size_bytes,
            max_files,
            writer: Mutex::new(FileState {
                writer: BufWriter::new(file),
                current_size,
            }),
        })
    }

    /// Path of the active audit file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &[u8]) -> Result<()> {
        let mut state = lock(&self.writer);

        if state.current_size > 0 && state.current_size + line.len() as u64 > self.max_size_bytes
        {
            state.writer.flush()?;
            match self.rotate() {
                Ok(fresh) => *state = fresh,
                Err(e) => tracing::error!(
                    "Cannot rotate audit file {}, appending past the limit: {e}",
                    self.path.display()
                ),
            }
        }

        state.writer.write_all(line)?;
        state.writer.flush()?;
        state.current_size += line.len() as u64;
        Ok(())
    }

    /// Shift rotated files and start a fresh active file.
    ///
    /// The fresh file is created before anything is renamed. On error the
    /// active file is back at `path` and the caller keeps its current state.
    fn rotate(&self) -> Result<FileState> {
        let base = self.path.display();
        let next = PathBuf::from(format!("{base}.next"));
        let newest = PathBuf::from(format!("{base}.1"));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&next)?;

        let _ = fs::remove_file(format!("{}.{}", base, self.max_files));
        for i in (1..self.max_files).rev() {
            let _ = fs::rename(format!("{base}.{i}"), format!("{}.{}", base, i + 1));
        }

        if let Err(e) = fs::rename(&self.path, &newest) {
            let _ = fs::remove_file(&next);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&next, &self.path) {
            let _ = fs::rename(&newest, &self.path);
            let _ = fs::remove_file(&next);
            return Err(e.into());
        }

        Ok(FileState {
            writer: BufWriter::new(file),
            current_size: 0,
        })
    }
}

impl AuditSink for FileAuditSink {
    fn log_event(&self, event: &AuditEvent) {
        let mut line = event.to_json();
        line.push('\n');
        if let Err(e) = self.append(line.as_bytes()) {
            // The request outcome stands; losing the record is an operator problem
            tracing::error!(
                "Failed to write audit record to {}: {} ({})",
                self.path.display(),
                e,
                line.trim_end()
            );
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events appended so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        lock(&self.events).clone()
    }

    /// Number of events appended so far.
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    /// Returns true if nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn log_event(&self, event: &AuditEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// Sends every event to all contained sinks.
#[derive(Default)]
pub struct MultiAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl MultiAuditSink {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn add(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    /// Number of contained sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl AuditSink for MultiAuditSink {
    fn log_event(&self, event: &AuditEvent) {
        for sink in &self.sinks {
            sink.log_event(event);
        }
    }
}
