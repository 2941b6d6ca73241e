//! Determines how many bytes of a candidate the CPU consumes as a single instruction.
//!
//! Candidates are written at the end of the sandbox page, right before a page that is never
//! mapped. If the CPU needs more bytes than what was written, it takes an instruction-fetch page
//! fault on the next page. Growing the number of bytes written until the fault disappears gives
//! the length of the instruction, and the fault raised by the complete instruction.

use std::fmt;

use crate::cpu::{CpuFeatures, CpuSignature};
use crate::error::*;
use crate::exceptions::{FatalFault, PageFaultErrorCode, TrapFrame, Vector};
use crate::memory::PAGE_SIZE;
use crate::search::{InstructionCandidate, MAX_INSTRUCTION_LENGTH};

/// Length reported for candidates that don't complete within [`MAX_INSTRUCTION_LENGTH`] bytes.
pub const SENTINEL_LENGTH: usize = MAX_INSTRUCTION_LENGTH + 1;

// -----------------------------------------------------------------------------------------------
// Oracle - Sandbox
// -----------------------------------------------------------------------------------------------

/// An isolated page from which single instructions can be executed in ring 3.
pub trait Sandbox {
    /// Guest virtual address of the sandbox page.
    fn page_addr(&self) -> u64;

    /// Writes `data` at `offset` bytes into the sandbox page.
    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()>;

    /// Executes a single ring 3 instruction at `rip` and returns the trap it ended with.
    ///
    /// Faults that can't be attributed to the sandboxed instruction are returned as
    /// [`CoreError::Fatal`], after which every call fails with [`CoreError::Halted`].
    fn execute_user(&mut self, rip: u64) -> Result<TrapFrame>;

    /// Features of the CPU running the sandbox.
    fn features(&self) -> CpuFeatures;

    /// Vendor and signature of the CPU running the sandbox.
    fn signature(&self) -> CpuSignature;

    /// The fault that halted the sandbox, if any.
    fn fatal_fault(&self) -> Option<&FatalFault>;

    /// Hexdump of the sandbox page.
    fn dump_page(&self) -> Result<String>;
}

// -----------------------------------------------------------------------------------------------
// Oracle - Length
// -----------------------------------------------------------------------------------------------

/// Outcome of probing one candidate.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ExecutionAttempt {
    /// Number of bytes of the instruction, or [`SENTINEL_LENGTH`].
    pub length: usize,
    /// Vector of the exception raised by the complete instruction.
    pub exception: u8,
}

impl ExecutionAttempt {
    /// Returns `true` if the candidate completed within the maximum instruction length.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.length <= MAX_INSTRUCTION_LENGTH
    }
}

impl fmt::Display for ExecutionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes, {} ({:02x})",
            self.length,
            Vector::from(self.exception).mnemonic(),
            self.exception
        )
    }
}

/// Returns `true` if `frame` is the instruction-fetch page fault raised when the instruction at
/// `guest_ip` runs past the end of the sandbox page at `page_addr`.
///
/// The error code only tells instruction fetches apart from data accesses when NX is enabled.
/// The faulting instruction pointer must be the start of the candidate: an `XBEGIN` whose abort
/// handler lies on the next page faults there too, but from a different `RIP`.
pub fn is_incomplete_fetch(
    frame: &TrapFrame,
    guest_ip: u64,
    page_addr: u64,
    features: &CpuFeatures,
) -> bool {
    let code = PageFaultErrorCode(frame.error_code);
    frame.vector() == Vector::PageFault
        && !code.get_present()
        && code.get_user()
        && (code.get_instruction() || !features.has_nx)
        && frame.cr2 == page_addr + PAGE_SIZE as u64
        && frame.rip == guest_ip
}

/// Probes `candidate` with growing lengths until the CPU stops faulting on the fetch.
pub fn find_instruction_length<S: Sandbox>(
    sandbox: &mut S,
    candidate: &InstructionCandidate,
) -> Result<ExecutionAttempt> {
    let features = sandbox.features();
    let page_addr = sandbox.page_addr();
    let mut exception = 0;
    for length in 1..=MAX_INSTRUCTION_LENGTH {
        let offset = PAGE_SIZE - length;
        let guest_ip = page_addr + offset as u64;
        sandbox.write(offset, candidate.prefix(length))?;
        let frame = sandbox.execute_user(guest_ip)?;
        exception = frame.vector;
        if !is_incomplete_fetch(&frame, guest_ip, page_addr, &features) {
            return Ok(ExecutionAttempt { length, exception });
        }
    }
    Ok(ExecutionAttempt {
        length: SENTINEL_LENGTH,
        exception,
    })
}

/// Returns `true` if going from `last` to `now` is worth reporting.
///
/// Instructions with an alignment-checked memory operand (e.g. `FXSAVE`) flip between #GP and #PF
/// depending on the operand, which isn't a change of instruction.
pub fn is_interesting_change(last: &ExecutionAttempt, now: &ExecutionAttempt) -> bool {
    if last == now {
        return false;
    }
    let flip = matches!(
        (Vector::from(last.exception), Vector::from(now.exception)),
        (Vector::PageFault, Vector::GeneralProtection)
            | (Vector::GeneralProtection, Vector::PageFault)
    );
    !(last.length == now.length && flip)
}

// -----------------------------------------------------------------------------------------------
// Oracle - Self Test
// -----------------------------------------------------------------------------------------------

/// Instructions of known length used to check the oracle before exploring.
pub const LENGTH_SELF_TESTS: &[(&[u8], usize)] = &[
    // nop
    (&[0x90], 1),
    // int3
    (&[0xcc], 1),
    // int 0x01
    (&[0xcd, 0x01], 2),
    // add [rax], al
    (&[0x00, 0x00], 2),
    // jmp 0x2
    (&[0xeb, 0x00], 2),
    // jmp 0x5
    (&[0xe9, 0x00, 0x00, 0x00, 0x00], 5),
    // lock add qword cs:[eax+4*eax+07e06df23h], 0efcdab89h
    (
        &[
            0x2e, 0x67, 0xf0, 0x48, 0x81, 0x84, 0x80, 0x23, 0xdf, 0x06, 0x7e, 0x89, 0xab, 0xcd,
            0xef,
        ],
        15,
    ),
    // xbegin 0x6
    (&[0xc7, 0xf8, 0x00, 0x00, 0x00, 0x00], 6),
    // std, the direction flag must not leak into the next probe
    (&[0xfd], 1),
    // mov ds, eax, segment registers must not leak into the next probe
    (&[0x8e, 0xd8], 2),
];

/// A reference instruction whose probed length is wrong.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SelfTestFailure {
    /// The instruction.
    pub candidate: InstructionCandidate,
    /// Its actual length.
    pub expected: usize,
    /// What the oracle returned.
    pub attempt: ExecutionAttempt,
}

impl fmt::Display for SelfTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} expected {} bytes, got {}",
            crate::utils::hex_bytes(self.candidate.prefix(self.expected)),
            self.expected,
            self.attempt
        )
    }
}

/// Runs the oracle on every instruction of [`LENGTH_SELF_TESTS`] and returns the failures.
pub fn self_test_lengths<S: Sandbox>(sandbox: &mut S) -> Result<Vec<SelfTestFailure>> {
    let mut failures = vec![];
    for &(bytes, expected) in LENGTH_SELF_TESTS {
        let candidate = InstructionCandidate::new(bytes);
        let attempt = find_instruction_length(sandbox, &candidate)?;
        if attempt.length != expected {
            failures.push(SelfTestFailure {
                candidate,
                expected,
                attempt,
            });
        }
    }
    Ok(failures)
}

/// A sandbox driven by a table of known instructions, used to test the oracle and the explorer
/// without a hypervisor.
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use crate::exceptions::*;
    use crate::memory::*;

    /// How a scripted instruction behaves once completely fetched.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum Behavior {
        /// Raises `vector` at the start of the instruction.
        Fault(u8),
        /// Completes and single-steps to the next instruction.
        Step,
        /// Completes and jumps to the start of the next page (like `XBEGIN` aborting).
        JumpToNextPage,
        /// Never completes within the maximum instruction length.
        Endless,
    }

    /// Returns the length and behavior of the instruction starting with `bytes`.
    pub type Model = fn(&[u8]) -> (usize, Behavior);

    /// Decodes a handful of opcodes, everything else is a one byte #UD.
    pub fn default_model(bytes: &[u8]) -> (usize, Behavior) {
        match bytes.first().copied().unwrap_or(0) {
            0x90 | 0xfd => (1, Behavior::Step),
            0xcc => (1, Behavior::Fault(0xd)),
            0xcd => (2, Behavior::Fault(0xd)),
            0x00 => (2, Behavior::Fault(0xe)),
            0xeb => (2, Behavior::Step),
            0xe9 => (5, Behavior::Step),
            0x8e => (2, Behavior::Step),
            0xc7 => (6, Behavior::JumpToNextPage),
            0x2e => (15, Behavior::Fault(0xd)),
            0x0f => (2, Behavior::Fault(0x6)),
            0xf1 => (0, Behavior::Endless),
            _ => (1, Behavior::Fault(0x6)),
        }
    }

    pub struct ScriptedSandbox {
        pub page: Vec<u8>,
        pub features: CpuFeatures,
        pub model: Model,
        pub executions: usize,
        /// Returns a fatal fault on this execution.
        pub fatal_at: Option<usize>,
        pub fatal: Option<FatalFault>,
    }

    impl ScriptedSandbox {
        pub fn new(model: Model) -> Self {
            Self {
                page: vec![0; PAGE_SIZE],
                features: CpuFeatures {
                    has_nx: true,
                    ..Default::default()
                },
                model,
                executions: 0,
                fatal_at: None,
                fatal: None,
            }
        }

        fn frame(&self, vector: u8, error_code: u64, rip: u64, cr2: u64) -> TrapFrame {
            TrapFrame {
                vector,
                error_code,
                rip,
                cs: USER_CS as u64,
                rflags: 0x102,
                ss: USER_DS as u64,
                cr2,
                kernel_rsp: TRAP_KERNEL_RSP,
                ..Default::default()
            }
        }
    }

    impl Sandbox for ScriptedSandbox {
        fn page_addr(&self) -> u64 {
            SANDBOX_VIRT_ADDR
        }

        fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
            self.page[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn execute_user(&mut self, rip: u64) -> Result<TrapFrame> {
            if self.fatal.is_some() {
                return Err(CoreError::Halted)?;
            }
            self.executions += 1;
            if self.fatal_at == Some(self.executions) {
                let fault = FatalFault {
                    title: "Exception in kernel mode".to_string(),
                    frame: Some(TrapFrame {
                        cs: KERNEL_CS as u64,
                        ..self.frame(0xd, 0, IRETQ_ADDR, 0)
                    }),
                };
                self.fatal = Some(fault.clone());
                return Err(CoreError::Fatal(fault.title))?;
            }
            let next_page = SANDBOX_VIRT_ADDR + PAGE_SIZE as u64;
            let offset = (rip - SANDBOX_VIRT_ADDR) as usize;
            let available = PAGE_SIZE - offset;
            let (length, behavior) = (self.model)(&self.page[offset..]);
            let fetch_fault = self.frame(
                0xe,
                // U/S and I/D, page not present
                0x14,
                rip,
                next_page,
            );
            if behavior == Behavior::Endless || available < length {
                return Ok(fetch_fault);
            }
            Ok(match behavior {
                Behavior::Fault(vector) => self.frame(vector, 0, rip, 0),
                Behavior::Step => self.frame(1, 0, rip + length as u64, 0),
                Behavior::JumpToNextPage => TrapFrame {
                    rip: next_page,
                    ..fetch_fault
                },
                Behavior::Endless => fetch_fault,
            })
        }

        fn features(&self) -> CpuFeatures {
            self.features
        }

        fn signature(&self) -> CpuSignature {
            CpuSignature {
                vendor: "GenuineIntel".to_string(),
                signature: 0x000906ea,
            }
        }

        fn fatal_fault(&self) -> Option<&FatalFault> {
            self.fatal.as_ref()
        }

        fn dump_page(&self) -> Result<String> {
            Ok(crate::utils::hex_bytes(&self.page[PAGE_SIZE - 16..]))
        }
    }
}
