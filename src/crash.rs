//! Fatal fault reports, and the files they are stored in.

use std::fmt;
use std::fs;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use crate::error::*;
use crate::exceptions::FatalFault;
use crate::search::InstructionCandidate;
use crate::utils::*;

/// Everything known about a kernel-fatal condition.
///
/// The report contains:
///
///  * the fault title and, when the fault went through an exception stub, the vector, error code,
///    faulting instruction pointer, faulting address and full register state;
///  * the candidate that was being probed;
///  * an hexadecimal dump of the sandbox page.
///
/// Every line of the rendered report starts with `!!! ` so it stands out in the probe stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FatalReport {
    /// The fault.
    pub fault: FatalFault,
    /// The candidate being probed when the fault happened.
    pub candidate: Option<InstructionCandidate>,
    /// Hexdump of the sandbox page.
    pub sandbox_dump: Option<String>,
}

impl FatalReport {
    /// Creates a report for `fault`.
    pub fn new(fault: FatalFault) -> Self {
        Self {
            fault,
            candidate: None,
            sandbox_dump: None,
        }
    }

    /// Adds the candidate being probed.
    pub fn candidate(mut self, candidate: InstructionCandidate) -> Self {
        self.candidate = Some(candidate);
        self
    }

    /// Adds the dump of the sandbox page.
    pub fn sandbox_dump(mut self, dump: String) -> Self {
        self.sandbox_dump = Some(dump);
        self
    }
}

impl fmt::Display for FatalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fault)?;
        if let Some(candidate) = &self.candidate {
            writeln!(f, "!!! Candidate: {}", hex_bytes(candidate.bytes()))?;
        }
        if let Some(frame) = &self.fault.frame {
            writeln!(f, "!!! Registers:")?;
            for line in frame.to_string().lines() {
                writeln!(f, "!!!   {}", line)?;
            }
        }
        if let Some(dump) = &self.sandbox_dump {
            writeln!(f, "!!! Sandbox page:")?;
            for line in dump.lines() {
                writeln!(f, "!!!   {}", line)?;
            }
        }
        writeln!(f, "!!! We're dead...")
    }
}

/// Stores fatal reports in a directory, one `fatal_<date>-<time>.info` file per report.
pub struct CrashHandler {
    /// The path to the report directory.
    path: PathBuf,
}

impl CrashHandler {
    /// Creates a new crash handler, creating the report directory if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self {
            path: path.as_ref().to_owned(),
        })
    }

    /// Generates a timestamped filepath in the report directory. An index is appended if the
    /// file already exists.
    fn report_filepath(&self) -> Result<PathBuf> {
        let fmt = time::format_description::parse("[year][month][day]-[hour][minute][second]")
            .map_err(|e| CoreError::Generic(e.to_string()))?;
        let now = time::OffsetDateTime::now_utc()
            .format(&fmt)
            .map_err(|e| CoreError::Generic(e.to_string()))?;
        let mut path = self.path.join(format!("fatal_{}.info", now));
        let mut index = 1;
        while path.exists() {
            path = self.path.join(format!("fatal_{}_{}.info", now, index));
            index += 1;
        }
        Ok(path)
    }

    /// Stores `report` and returns the path of the file.
    pub fn store_report(&self, report: &FatalReport) -> Result<PathBuf> {
        let filepath = self.report_filepath()?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&filepath)?;
        file.write_all(report.to_string().as_bytes())?;
        Ok(filepath)
    }
}
