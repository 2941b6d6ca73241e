//! The line-oriented diagnostic stream, and the parser reading it back for offline analysis.
//!
//! Every line starts with a tag so that the stream stays greppable:
//!
//! ```text
//! >>> CPU is GenuineIntel 000906ea.
//! EXC 06 OK | 0F 0B | OK 02 ud2
//! EXC 0E ?? | F2 F3 F2 F3 F2 F3 F2 F3 F2 F3 F2 F3 F2 F3 F2
//! !!! Exception in kernel mode
//! >>> Done!
//! ```

use regex::Regex;

use std::fmt;
use std::io::{BufRead, Write};
use std::str::FromStr;

use crate::crash::FatalReport;
use crate::disasm::{Crosscheck, DecodedInstruction, Decoder, Verdict};
use crate::error::*;
use crate::exceptions::Vector;
use crate::oracle::{ExecutionAttempt, SENTINEL_LENGTH};
use crate::search::{InstructionCandidate, MAX_INSTRUCTION_LENGTH};
use crate::utils::*;

// -----------------------------------------------------------------------------------------------
// Output - Records
// -----------------------------------------------------------------------------------------------

/// One reported probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProbeRecord {
    /// The probed candidate.
    pub candidate: InstructionCandidate,
    /// What the CPU did with it.
    pub attempt: ExecutionAttempt,
    /// What the disassembler thinks about it, when enabled.
    pub crosscheck: Option<Crosscheck>,
}

impl ProbeRecord {
    /// Bytes of the instruction, or of the whole candidate if it never completed.
    pub fn bytes(&self) -> &[u8] {
        self.candidate.prefix(self.attempt.length)
    }
}

impl fmt::Display for ProbeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EXC {:02X} {} | {}",
            self.attempt.exception,
            match self.attempt.is_complete() {
                true => "OK",
                false => "??",
            },
            hex_bytes(self.bytes())
        )?;
        if let Some(crosscheck) = &self.crosscheck {
            write!(f, " | {}", crosscheck)?;
        }
        Ok(())
    }
}

impl FromStr for ProbeRecord {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let re = Regex::new(
            r"^EXC ([0-9A-Fa-f]{2}) (OK|\?\?) \| ([0-9A-Fa-f]{2}(?: [0-9A-Fa-f]{2})*)(?: \| (OK|BUG|UNKN) (\d+) (.*))?$",
        )
        .map_err(|e| Error::Generic(e.to_string()))?;
        let invalid = || Error::Generic(format!("invalid probe record: {:?}", line));
        let caps = re.captures(line.trim_end()).ok_or_else(invalid)?;
        let exception = u8::from_str_radix(&caps[1], 16).map_err(|_| invalid())?;
        let bytes = parse_hex_bytes(&caps[3]).ok_or_else(invalid)?;
        if bytes.len() > MAX_INSTRUCTION_LENGTH {
            return Err(invalid());
        }
        let length = match &caps[2] {
            "OK" => bytes.len(),
            _ => SENTINEL_LENGTH,
        };
        let crosscheck = match (caps.get(4), caps.get(5), caps.get(6)) {
            (Some(verdict), Some(decoded_length), Some(text)) => {
                let decoded_length = decoded_length
                    .as_str()
                    .parse::<usize>()
                    .map_err(|_| invalid())?;
                let decoded = match (decoded_length, text.as_str()) {
                    (0, "(bad)") => None,
                    (_, text) => {
                        let (mnemonic, operands) = text.split_once(' ').unwrap_or((text, ""));
                        Some(DecodedInstruction {
                            length: decoded_length,
                            mnemonic: mnemonic.to_string(),
                            operands: operands.to_string(),
                        })
                    }
                };
                Some(Crosscheck {
                    verdict: verdict.as_str().parse()?,
                    decoded,
                })
            }
            _ => None,
        };
        Ok(Self {
            candidate: InstructionCandidate::new(&bytes),
            attempt: ExecutionAttempt { length, exception },
            crosscheck,
        })
    }
}

// -----------------------------------------------------------------------------------------------
// Output - Device
// -----------------------------------------------------------------------------------------------

/// Append-only diagnostic stream.
pub struct OutputDevice<W: Write> {
    inner: W,
}

impl<W: Write> OutputDevice<W> {
    /// Creates an output device writing to `inner`.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes a banner or progress line.
    pub fn message(&mut self, msg: impl fmt::Display) -> Result<()> {
        writeln!(self.inner, ">>> {}", msg)?;
        Ok(())
    }

    /// Writes a line without any tag.
    pub fn line(&mut self, msg: impl fmt::Display) -> Result<()> {
        writeln!(self.inner, "{}", msg)?;
        Ok(())
    }

    /// Writes a probe line.
    pub fn probe(&mut self, record: &ProbeRecord) -> Result<()> {
        writeln!(self.inner, "{}", record)?;
        Ok(())
    }

    /// Writes a fatal report.
    pub fn fatal(&mut self, report: &FatalReport) -> Result<()> {
        write!(self.inner, "{}", report)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

// -----------------------------------------------------------------------------------------------
// Output - Offline Analysis
// -----------------------------------------------------------------------------------------------

/// Reads a probe log from `input` and writes the completed records the disassembler disagrees
/// with to `output`. Records that raised #UD and lines that aren't probe records are skipped.
///
/// Returns the number of disagreements.
pub fn analyze_log<R: BufRead, W: Write>(input: R, mut output: W) -> Result<usize> {
    let mut count = 0;
    for line in input.lines() {
        let record = match ProbeRecord::from_str(&line?) {
            Ok(record) => record,
            Err(_) => continue,
        };
        if !record.attempt.is_complete()
            || Vector::from(record.attempt.exception) == Vector::InvalidOpcode
        {
            continue;
        }
        let decoded = Decoder::decode(record.candidate.bytes())?;
        let (length, text) = match &decoded {
            Some(insn) => (insn.length, insn.to_string()),
            None => (0, "(bad)".to_string()),
        };
        if length == record.attempt.length {
            continue;
        }
        writeln!(
            output,
            "{} {:02} | {:02} {}",
            hex_bytes(record.bytes()),
            record.attempt.length,
            length,
            text
        )?;
        count += 1;
    }
    Ok(count)
}

/// Verdict counts over a run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct VerdictCounts {
    /// Number of `OK` verdicts.
    pub ok: u64,
    /// Number of `BUG` verdicts.
    pub bug: u64,
    /// Number of `UNKN` verdicts.
    pub unknown: u64,
}

impl VerdictCounts {
    /// Counts `verdict`.
    pub fn add(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Ok => self.ok += 1,
            Verdict::Bug => self.bug += 1,
            Verdict::Unknown => self.unknown += 1,
        }
    }
}
