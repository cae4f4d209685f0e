//! Append-only status log and the side-channel result file.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::matcher::{flatten, Marker};
use crate::rules::{EXCLUDE_SOURCE_FLAG, INIT_PARAM_FLAG, INSTRUMENTED_MARKER};
use crate::supervise::ExecutionOutcome;

pub const DELIMITER: char = ';';
const DELIMITER_REPLACEMENT: char = ',';
const BIN_DIR_MARKER: &str = ".bin/";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_TIMEOUT: &str = "timeout";
pub const STATUS_SKIPPED: &str = "skipped";
pub const STATUS_INTERRUPTED: &str = "interrupted";

/// Result file the instrumented child may write before exiting.
#[derive(Debug, Clone)]
pub struct SideChannel {
    path: PathBuf,
}

impl SideChannel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove a result left by an earlier run. Must happen before spawning.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed stale result file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", self.path.display())),
        }
    }

    /// The trimmed status, or `None` when the file is missing or blank.
    pub fn read(&self) -> Option<String> {
        fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Status for a finished run; the side channel is consulted only for
/// instrumented runs that neither timed out nor were interrupted.
pub fn derive_status(instrumented: bool, outcome: &ExecutionOutcome, side_channel: &SideChannel) -> String {
    if outcome.timed_out {
        return STATUS_TIMEOUT.to_string();
    }
    if outcome.forwarded_signal.is_some() {
        return STATUS_INTERRUPTED.to_string();
    }
    if instrumented {
        if let Some(status) = side_channel.read() {
            return status;
        }
    }
    STATUS_SUCCESS.to_string()
}

/// The instrumentation engine is engaged only when its marker flag made it
/// onto the command line.
pub fn is_instrumented(final_argv: &[String]) -> bool {
    Marker::ExactFlag(INSTRUMENTED_MARKER).matches(final_argv)
}

/// Name of what actually ran, recovered from a possibly heavily rewritten
/// command line.
pub fn identify_target(argv: &[String], instrumented: bool, shim_script: &Path) -> String {
    let installed_bin = argv
        .iter()
        .skip(1)
        .find(|token| token.contains(BIN_DIR_MARKER) && !token.contains(EXCLUDE_SOURCE_FLAG));
    if let Some(bin) = installed_bin {
        return bin.clone();
    }

    let start = if instrumented {
        // The last --initParam and its value precede the script.
        argv.iter()
            .rposition(|token| token == INIT_PARAM_FLAG)
            .map(|idx| idx + 2)
    } else {
        let shim = shim_script.to_string_lossy();
        argv.iter()
            .position(|token| token.as_str() == shim)
            .map(|idx| idx + 1)
    };
    match start {
        Some(idx) if idx < argv.len() => argv[idx..].join(" "),
        _ => flatten(argv),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusRecord {
    pub identified_target: String,
    pub status: String,
    pub instrumented: bool,
}

fn sanitize_field(field: &str) -> String {
    field
        .chars()
        .map(|c| match c {
            DELIMITER => DELIMITER_REPLACEMENT,
            '\n' | '\r' => ' ',
            other => other,
        })
        .collect()
}

impl StatusRecord {
    pub fn to_line(&self) -> String {
        format!(
            "{}{}{}{}{}\n",
            sanitize_field(&self.identified_target),
            DELIMITER,
            sanitize_field(&self.status),
            DELIMITER,
            if self.instrumented {
                "instrumented"
            } else {
                "not-instrumented"
            }
        )
    }

    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end_matches(['\n', '\r']).split(DELIMITER);
        let identified_target = fields.next()?.to_string();
        let status = fields.next()?.to_string();
        let instrumented = match fields.next()? {
            "instrumented" => true,
            "not-instrumented" => false,
            _ => return None,
        };
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            identified_target,
            status,
            instrumented,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StatusLog {
    path: PathBuf,
}

impl StatusLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// One `write` on an `O_APPEND` handle per record, so concurrent writers
    /// never interleave within a line.
    pub fn append(&self, record: &StatusRecord) -> Result<()> {
        let line = record.to_line();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open status log {}", self.path.display()))?;
        let written = file
            .write(line.as_bytes())
            .with_context(|| format!("append to {}", self.path.display()))?;
        if written != line.len() {
            anyhow::bail!(
                "short write to {}: {} of {} bytes",
                self.path.display(),
                written,
                line.len()
            );
        }
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<StatusRecord>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        Ok(text.lines().filter_map(StatusRecord::parse_line).collect())
    }
}
