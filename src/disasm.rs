//! Cross-checks probed instruction lengths against Capstone.
//!
//! The disassembler is only ever used as a second opinion: it never influences what gets probed
//! or how lengths are computed.

use std::fmt;

use crate::core::CSE;
use crate::error::*;
use crate::exceptions::Vector;
use crate::oracle::ExecutionAttempt;

/// An instruction decoded by the disassembler.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DecodedInstruction {
    /// Number of bytes of the instruction.
    pub length: usize,
    /// Mnemonic of the instruction.
    pub mnemonic: String,
    /// Operands of the instruction.
    pub operands: String,
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operands.is_empty() {
            true => write!(f, "{}", self.mnemonic),
            false => write!(f, "{} {}", self.mnemonic, self.operands),
        }
    }
}

/// Agreement between the CPU and the disassembler.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Verdict {
    /// Both agree on the length, or neither recognizes the instruction.
    Ok,
    /// Both decode an instruction, with different lengths.
    Bug,
    /// The CPU executes something the disassembler doesn't know about.
    Unknown,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Ok => write!(f, "OK"),
            Verdict::Bug => write!(f, "BUG"),
            Verdict::Unknown => write!(f, "UNKN"),
        }
    }
}

impl std::str::FromStr for Verdict {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OK" => Ok(Verdict::Ok),
            "BUG" => Ok(Verdict::Bug),
            "UNKN" => Ok(Verdict::Unknown),
            _ => Err(Error::Generic(format!("invalid verdict: {}", s))),
        }
    }
}

/// Result of cross-checking one probed instruction.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Crosscheck {
    /// The verdict.
    pub verdict: Verdict,
    /// What the disassembler decoded, if anything.
    pub decoded: Option<DecodedInstruction>,
}

impl fmt::Display for Crosscheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.decoded {
            Some(insn) => write!(f, "{} {:02} {}", self.verdict, insn.length, insn),
            None => write!(f, "{} {:02} (bad)", self.verdict, 0),
        }
    }
}

/// Disassembler wrapper.
pub struct Decoder;

impl Decoder {
    /// Decodes the first instruction in `code`.
    pub fn decode(code: &[u8]) -> Result<Option<DecodedInstruction>> {
        CSE.with(|cs| {
            let insns = cs
                .disasm_count(code, 0, 1)
                .map_err(|e| Error::Generic(format!("could not disassemble: {}", e)))?;
            Ok(insns.as_ref().first().map(|insn| DecodedInstruction {
                length: insn.bytes().len(),
                mnemonic: insn.mnemonic().unwrap_or_default().to_string(),
                operands: insn.op_str().unwrap_or_default().to_string(),
            }))
        })
    }

    /// Compares what the CPU did with what the disassembler decoded.
    pub fn classify(attempt: &ExecutionAttempt, decoded: Option<&DecodedInstruction>) -> Verdict {
        match decoded {
            Some(insn) if insn.length == attempt.length => Verdict::Ok,
            Some(_) => Verdict::Bug,
            None if Vector::from(attempt.exception) == Vector::InvalidOpcode => Verdict::Ok,
            None => Verdict::Unknown,
        }
    }

    /// Decodes `code` and compares the result with `attempt`.
    pub fn crosscheck(code: &[u8], attempt: &ExecutionAttempt) -> Result<Crosscheck> {
        let decoded = Self::decode(code)?;
        Ok(Crosscheck {
            verdict: Self::classify(attempt, decoded.as_ref()),
            decoded,
        })
    }

    /// Checks the disassembler on instructions it is known to get right.
    pub fn self_test() -> Result<bool> {
        let tests: [(&[u8], &str, usize); 2] =
            [(&[0x90], "nop", 1), (&[0xe9, 0x00, 0x00, 0x00, 0x00], "jmp", 5)];
        for (code, mnemonic, length) in tests {
            match Self::decode(code)? {
                Some(insn) if insn.mnemonic == mnemonic && insn.length == length => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }
}
