//! Handles everything related to x86 exceptions, from building the guest's interrupt descriptor
//! table and entry stubs, to deciding what to do with a trap taken by the guest.

use bitfield::bitfield;
use kvm_bindings::kvm_regs;

use std::fmt;

use crate::core::KSE;
use crate::error::*;
use crate::memory::*;

/// I/O port the exception stubs write to in order to leave the guest.
pub const TRAP_PORT: u16 = 0xe0;

/// Number of architectural exception vectors.
pub const NB_VECTORS: usize = 32;

/// Number of quad words pushed on the kernel stack when a trap reaches the host: vector and error
/// code (pushed by the stub), then RIP, CS, RFLAGS, RSP and SS (pushed by the CPU).
pub const TRAP_FRAME_WORDS: usize = 7;

/// Kernel stack pointer observed when a trap taken from ring 3 reaches the host.
pub const TRAP_KERNEL_RSP: u64 = KERNEL_STACK_TOP - (TRAP_FRAME_WORDS * 8) as u64;

// -----------------------------------------------------------------------------------------------
// Exceptions - Types
// -----------------------------------------------------------------------------------------------

/// x86 exception vectors.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Vector {
    /// #DE
    DivideError,
    /// #DB, also raised after each single-stepped instruction.
    Debug,
    /// NMI
    Nmi,
    /// #BP
    Breakpoint,
    /// #OF
    Overflow,
    /// #BR
    BoundRange,
    /// #UD
    InvalidOpcode,
    /// #NM
    DeviceNotAvailable,
    /// #DF
    DoubleFault,
    /// Coprocessor segment overrun (reserved on modern CPUs).
    CoprocessorSegmentOverrun,
    /// #TS
    InvalidTss,
    /// #NP
    SegmentNotPresent,
    /// #SS
    StackSegmentFault,
    /// #GP
    GeneralProtection,
    /// #PF
    PageFault,
    /// #MF
    X87FloatingPoint,
    /// #AC
    AlignmentCheck,
    /// #MC
    MachineCheck,
    /// #XM
    SimdFloatingPoint,
    /// #VE
    Virtualization,
    /// #CP
    ControlProtection,
    /// #HV
    HypervisorInjection,
    /// #VC
    VmmCommunication,
    /// #SX
    Security,
    /// Reserved or unknown vector.
    Reserved(u8),
}

impl From<u8> for Vector {
    fn from(val: u8) -> Self {
        match val {
            0x00 => Self::DivideError,
            0x01 => Self::Debug,
            0x02 => Self::Nmi,
            0x03 => Self::Breakpoint,
            0x04 => Self::Overflow,
            0x05 => Self::BoundRange,
            0x06 => Self::InvalidOpcode,
            0x07 => Self::DeviceNotAvailable,
            0x08 => Self::DoubleFault,
            0x09 => Self::CoprocessorSegmentOverrun,
            0x0a => Self::InvalidTss,
            0x0b => Self::SegmentNotPresent,
            0x0c => Self::StackSegmentFault,
            0x0d => Self::GeneralProtection,
            0x0e => Self::PageFault,
            0x10 => Self::X87FloatingPoint,
            0x11 => Self::AlignmentCheck,
            0x12 => Self::MachineCheck,
            0x13 => Self::SimdFloatingPoint,
            0x14 => Self::Virtualization,
            0x15 => Self::ControlProtection,
            0x1c => Self::HypervisorInjection,
            0x1d => Self::VmmCommunication,
            0x1e => Self::Security,
            _ => Self::Reserved(val),
        }
    }
}

impl Vector {
    /// Returns `true` if the CPU pushes an error code for exceptions raised on vector `vector`.
    pub const fn has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21 | 29 | 30)
    }

    /// Short mnemonic of the vector.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::DivideError => "#DE",
            Self::Debug => "#DB",
            Self::Nmi => "NMI",
            Self::Breakpoint => "#BP",
            Self::Overflow => "#OF",
            Self::BoundRange => "#BR",
            Self::InvalidOpcode => "#UD",
            Self::DeviceNotAvailable => "#NM",
            Self::DoubleFault => "#DF",
            Self::CoprocessorSegmentOverrun => "#CSO",
            Self::InvalidTss => "#TS",
            Self::SegmentNotPresent => "#NP",
            Self::StackSegmentFault => "#SS",
            Self::GeneralProtection => "#GP",
            Self::PageFault => "#PF",
            Self::X87FloatingPoint => "#MF",
            Self::AlignmentCheck => "#AC",
            Self::MachineCheck => "#MC",
            Self::SimdFloatingPoint => "#XM",
            Self::Virtualization => "#VE",
            Self::ControlProtection => "#CP",
            Self::HypervisorInjection => "#HV",
            Self::VmmCommunication => "#VC",
            Self::Security => "#SX",
            Self::Reserved(_) => "#??",
        }
    }
}

bitfield! {
    /// Error code pushed by the CPU on a page fault.
    ///
    /// - **P:** the fault was a protection violation (0 means the page was not present)
    /// - **W/R:** the access was a write
    /// - **U/S:** the access was made from ring 3
    /// - **RSVD:** a reserved bit was set in a paging structure
    /// - **I/D:** the access was an instruction fetch (only reported when NX is enabled)
    #[derive(Copy, Clone, Eq, Hash, PartialEq)]
    pub struct PageFaultErrorCode(u64);
    impl Debug;
    pub get_present, _: 0;
    pub get_write, _: 1;
    pub get_user, _: 2;
    pub get_reserved, _: 3;
    pub get_instruction, _: 4;
    pub get_protection_key, _: 5;
    pub get_shadow_stack, _: 6;
}

// -----------------------------------------------------------------------------------------------
// Exceptions - Trap Frame
// -----------------------------------------------------------------------------------------------

/// General-purpose registers of the guest.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl From<&kvm_regs> for GeneralRegisters {
    fn from(regs: &kvm_regs) -> Self {
        Self {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
        }
    }
}

impl fmt::Display for GeneralRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regs = [
            ("rax", self.rax),
            ("rbx", self.rbx),
            ("rcx", self.rcx),
            ("rdx", self.rdx),
            ("rsi", self.rsi),
            ("rdi", self.rdi),
            ("rbp", self.rbp),
            ("r8", self.r8),
            ("r9", self.r9),
            ("r10", self.r10),
            ("r11", self.r11),
            ("r12", self.r12),
            ("r13", self.r13),
            ("r14", self.r14),
            ("r15", self.r15),
        ];
        for chunk in regs.chunks(4) {
            let line = chunk
                .iter()
                .map(|(name, value)| format!("{:>3}: {:016x}", name, value))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Snapshot of the guest state when a trap reached the host.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapFrame {
    /// General-purpose registers at the time of the trap.
    pub regs: GeneralRegisters,
    /// Exception vector.
    pub vector: u8,
    /// Error code, zero for vectors without one.
    pub error_code: u64,
    /// Faulting (or, for traps, next) instruction pointer.
    pub rip: u64,
    /// Code segment selector of the interrupted context.
    pub cs: u64,
    /// Flags of the interrupted context.
    pub rflags: u64,
    /// Stack pointer of the interrupted context.
    pub rsp: u64,
    /// Stack segment selector of the interrupted context.
    pub ss: u64,
    /// Faulting address register.
    pub cr2: u64,
    /// Kernel stack pointer where the frame was found.
    pub kernel_rsp: u64,
}

impl TrapFrame {
    /// Builds a frame from the words found on the kernel stack at `kernel_rsp`.
    pub fn from_stack(
        words: [u64; TRAP_FRAME_WORDS],
        regs: GeneralRegisters,
        cr2: u64,
        kernel_rsp: u64,
    ) -> Self {
        Self {
            regs,
            vector: words[0] as u8,
            error_code: words[1],
            rip: words[2],
            cs: words[3],
            rflags: words[4],
            rsp: words[5],
            ss: words[6],
            cr2,
            kernel_rsp,
        }
    }

    /// Returns `true` if the trap was taken from ring 3.
    #[inline]
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Returns the exception vector.
    #[inline]
    pub fn vector(&self) -> Vector {
        Vector::from(self.vector)
    }
}

impl fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "vector: {:02x} ({})  error code: {:016x}",
            self.vector,
            self.vector().mnemonic(),
            self.error_code
        )?;
        writeln!(
            f,
            "cs:rip: {:04x}:{:016x}  ss:rsp: {:04x}:{:016x}",
            self.cs, self.rip, self.ss, self.rsp
        )?;
        writeln!(
            f,
            "rflags: {:016x}  cr2: {:016x}  kernel rsp: {:016x}",
            self.rflags, self.cr2, self.kernel_rsp
        )?;
        write!(f, "{}", self.regs)
    }
}

// -----------------------------------------------------------------------------------------------
// Exceptions - Trap Path
// -----------------------------------------------------------------------------------------------

/// Where a sandboxed execution returns to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReturnPoint {
    /// Kernel stack pointer the trap frame of the sandboxed instruction must be found at.
    pub kernel_rsp: u64,
}

/// Pending continuation of the trap path.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Continuation {
    /// No sandboxed execution is in flight.
    #[default]
    Idle,
    /// A sandboxed execution is in flight and will resume at the return point.
    Armed(ReturnPoint),
}

/// A fault that can't be attributed to sandboxed code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FatalFault {
    /// Short description of what went wrong.
    pub title: String,
    /// The guest state, when the fault went through an exception stub.
    pub frame: Option<TrapFrame>,
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "!!! {}", self.title)?;
        if let Some(frame) = &self.frame {
            writeln!(
                f,
                "!!! Vector: {:02X} Error: {:016X}",
                frame.vector, frame.error_code
            )?;
            writeln!(f, "!!! CS:RIP: {:04X}:{:016X}", frame.cs, frame.rip)?;
            writeln!(f, "!!! CR2: {:016X}", frame.cr2)?;
            writeln!(
                f,
                "!!! RDI: {:016X} RSI: {:016X}",
                frame.regs.rdi, frame.regs.rsi
            )?;
        }
        Ok(())
    }
}

/// What the trap path decided to do with a trap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrapOutcome {
    /// The trap belongs to the sandboxed execution, which returns with this frame.
    Resume(TrapFrame),
    /// The trap is kernel-fatal.
    Fatal(FatalFault),
}

/// State machine deciding, for every trap, whether it resumes the sandbox caller or is fatal.
///
/// A trap resumes the caller only if a continuation is armed, the trap was taken from ring 3 and
/// its frame sits exactly where the return point expects it. The continuation is consumed by
/// every trap, whatever the outcome.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapPath {
    continuation: Continuation,
}

impl TrapPath {
    /// Creates an idle trap path.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the continuation before a sandboxed execution.
    pub fn arm(&mut self, return_point: ReturnPoint) {
        self.continuation = Continuation::Armed(return_point);
    }

    /// Returns the current continuation.
    pub fn continuation(&self) -> Continuation {
        self.continuation
    }

    /// Handles a trap.
    pub fn dispatch(&mut self, frame: TrapFrame) -> TrapOutcome {
        let continuation = std::mem::take(&mut self.continuation);
        let title = match continuation {
            Continuation::Idle => "Exception without a pending continuation",
            Continuation::Armed(_) if !frame.is_user() => "Exception in kernel mode",
            Continuation::Armed(rp) if rp.kernel_rsp != frame.kernel_rsp => {
                "Exception frame outside of the sandbox return stack"
            }
            Continuation::Armed(_) => return TrapOutcome::Resume(frame),
        };
        TrapOutcome::Fatal(FatalFault {
            title: title.to_string(),
            frame: Some(frame),
        })
    }
}

// -----------------------------------------------------------------------------------------------
// Exceptions - Guest Setup
// -----------------------------------------------------------------------------------------------

/// A 64-bit interrupt gate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IdtGate {
    /// Address of the handler.
    pub handler: u64,
    /// Code segment selector of the handler.
    pub selector: u16,
    /// Descriptor privilege level.
    pub dpl: u8,
}

impl IdtGate {
    /// Type of a 64-bit interrupt gate.
    const INTERRUPT_GATE: u8 = 0xe;

    /// Encodes the gate.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[0..2].copy_from_slice(&(self.handler as u16).to_le_bytes());
        raw[2..4].copy_from_slice(&self.selector.to_le_bytes());
        // IST is not used.
        raw[4] = 0;
        raw[5] = 0x80 | ((self.dpl & 3) << 5) | Self::INTERRUPT_GATE;
        raw[6..8].copy_from_slice(&((self.handler >> 16) as u16).to_le_bytes());
        raw[8..12].copy_from_slice(&((self.handler >> 32) as u32).to_le_bytes());
        raw
    }
}

/// Exception handling in the guest.
///
/// # Exception Stubs
///
/// Every vector of the IDT points to a small stub in the stub table. Stubs run in ring 0 on the
/// kernel stack from the TSS, normalize the stack layout by pushing a null error code when the
/// CPU doesn't push one, push their vector number and leave the guest with an `out` to
/// [`TRAP_PORT`]. General purpose registers are left untouched, the host reads them as they were
/// when the trap was taken:
///
/// ```text
///     push 0          ; only for vectors without an error code
///     push <vector>
///     out TRAP_PORT, al
///     hlt             ; never resumed
/// ```
///
/// When the host sees the port write, the kernel stack contains:
///
/// ```text
/// rsp + 0x00  vector
/// rsp + 0x08  error code
/// rsp + 0x10  rip
/// rsp + 0x18  cs
/// rsp + 0x20  rflags
/// rsp + 0x28  rsp
/// rsp + 0x30  ss
/// ```
///
/// # Ring 3 Entry
///
/// The host enters the sandbox through an `iretq` trampoline, with an interrupt frame that
/// targets the user code segment and has the trap flag set.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Exceptions;

impl Exceptions {
    /// Writes the exception stubs, the IDT and the `iretq` trampoline into guest memory.
    pub fn init(mem: &mut GuestMemory) -> Result<()> {
        for vector in 0..NB_VECTORS as u8 {
            let stub = Self::assemble(&Self::stub_source(vector), Self::stub_addr(vector))?;
            if stub.len() > STUB_SIZE {
                return Err(ExceptionError::StubTooLarge(stub.len()))?;
            }
            mem.write(Self::stub_addr(vector), &stub)?;
            let gate = IdtGate {
                handler: Self::stub_addr(vector),
                selector: KERNEL_CS,
                dpl: 0,
            };
            mem.write(IDT_ADDR + 16 * vector as u64, &gate.to_bytes())?;
        }
        let iretq = Self::assemble("iretq", IRETQ_ADDR)?;
        mem.write(IRETQ_ADDR, &iretq)
    }

    /// Address of the stub of `vector`.
    #[inline]
    pub fn stub_addr(vector: u8) -> u64 {
        STUBS_ADDR + (vector as usize * STUB_SIZE) as u64
    }

    /// Assembly of the stub of `vector`.
    fn stub_source(vector: u8) -> String {
        let error_code = match Vector::has_error_code(vector) {
            true => "",
            false => "push 0; ",
        };
        format!(
            "{}push {}; out {}, al; hlt",
            error_code, vector, TRAP_PORT
        )
    }

    /// Assembles `source` at `addr`.
    fn assemble(source: &str, addr: u64) -> Result<Vec<u8>> {
        KSE.with(|ks| ks.asm(source.to_string(), addr))
            .map(|asm| asm.bytes)
            .map_err(|e| ExceptionError::Assembly(format!("{}: {:?}", source, e)).into())
    }

    /// Reads the trap frame left on the kernel stack by an exception stub.
    pub fn read_trap_frame(
        mem: &GuestMemory,
        regs: &kvm_regs,
        cr2: u64,
    ) -> Result<TrapFrame> {
        let kernel_rsp = regs.rsp;
        let mut words = [0u64; TRAP_FRAME_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = mem.read_qword(kernel_rsp + 8 * i as u64)?;
        }
        if words[0] >= NB_VECTORS as u64 {
            return Err(ExceptionError::InvalidVector(words[0]))?;
        }
        Ok(TrapFrame::from_stack(
            words,
            GeneralRegisters::from(regs),
            cr2,
            kernel_rsp,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_frame() -> TrapFrame {
        TrapFrame {
            vector: 0xe,
            error_code: 0x14,
            rip: SANDBOX_VIRT_ADDR + 0xfff,
            cs: USER_CS as u64,
            ss: USER_DS as u64,
            cr2: SANDBOX_VIRT_ADDR + 0x1000,
            kernel_rsp: TRAP_KERNEL_RSP,
            ..Default::default()
        }
    }

    const RETURN_POINT: ReturnPoint = ReturnPoint {
        kernel_rsp: TRAP_KERNEL_RSP,
    };

    #[test]
    fn exceptions_vectors() {
        assert_eq!(Vector::from(6), Vector::InvalidOpcode);
        assert_eq!(Vector::from(0xe), Vector::PageFault);
        assert_eq!(Vector::from(0xf), Vector::Reserved(0xf));
        assert_eq!(Vector::from(6).mnemonic(), "#UD");
        let with_error = (0..32u8)
            .filter(|&v| Vector::has_error_code(v))
            .collect::<Vec<_>>();
        assert_eq!(with_error, vec![8, 10, 11, 12, 13, 14, 17, 21, 29, 30]);
    }

    #[test]
    fn exceptions_page_fault_error_code() {
        let code = PageFaultErrorCode(0x15);
        assert!(code.get_present());
        assert!(code.get_user());
        assert!(code.get_instruction());
        assert!(!code.get_write());
    }

    #[test]
    fn exceptions_trap_path_resumes_user_traps() {
        let mut trap_path = TrapPath::new();
        trap_path.arm(RETURN_POINT);
        assert_eq!(trap_path.continuation(), Continuation::Armed(RETURN_POINT));
        let frame = user_frame();
        assert_eq!(trap_path.dispatch(frame), TrapOutcome::Resume(frame));
        assert_eq!(trap_path.continuation(), Continuation::Idle);
    }

    #[test]
    fn exceptions_trap_path_idle_is_fatal() {
        let mut trap_path = TrapPath::new();
        match trap_path.dispatch(user_frame()) {
            TrapOutcome::Fatal(fault) => {
                assert_eq!(fault.title, "Exception without a pending continuation");
                assert_eq!(fault.frame, Some(user_frame()));
            }
            outcome => panic!("unexpected outcome {:?}", outcome),
        }
        // A consumed continuation doesn't resume twice.
        trap_path.arm(RETURN_POINT);
        assert!(matches!(
            trap_path.dispatch(user_frame()),
            TrapOutcome::Resume(_)
        ));
        assert!(matches!(
            trap_path.dispatch(user_frame()),
            TrapOutcome::Fatal(_)
        ));
    }

    #[test]
    fn exceptions_trap_path_kernel_fault_is_fatal() {
        let mut trap_path = TrapPath::new();
        trap_path.arm(RETURN_POINT);
        let frame = TrapFrame {
            cs: KERNEL_CS as u64,
            ..user_frame()
        };
        assert!(matches!(trap_path.dispatch(frame), TrapOutcome::Fatal(_)));
        assert_eq!(trap_path.continuation(), Continuation::Idle);

        trap_path.arm(RETURN_POINT);
        let frame = TrapFrame {
            kernel_rsp: TRAP_KERNEL_RSP - 0x38,
            ..user_frame()
        };
        assert!(matches!(trap_path.dispatch(frame), TrapOutcome::Fatal(_)));
    }

    #[test]
    fn exceptions_fatal_fault_display() {
        let fault = FatalFault {
            title: "Exception in kernel mode".to_string(),
            frame: Some(user_frame()),
        };
        let text = fault.to_string();
        assert!(text.lines().all(|l| l.starts_with("!!! ")));
        assert!(text.contains("Vector: 0E Error: 0000000000000014"));
        assert!(text.contains("CR2: 0000000100001000"));
    }

    #[test]
    fn exceptions_idt_gate() {
        let gate = IdtGate {
            handler: 0x1234_5678_9abc_def0,
            selector: KERNEL_CS,
            dpl: 0,
        };
        assert_eq!(
            gate.to_bytes(),
            [0xf0, 0xde, 0x08, 0x00, 0x00, 0x8e, 0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0]
        );
    }

    #[test]
    fn exceptions_stub_source() {
        assert_eq!(
            Exceptions::stub_source(1),
            format!("push 0; push 1; out {}, al; hlt", TRAP_PORT)
        );
        assert!(Exceptions::stub_source(14).starts_with("push 14;"));
        assert!((0..NB_VECTORS as u8).all(|v| !Exceptions::stub_source(v).contains("mov")));
    }

    #[test]
    fn exceptions_init() {
        let mut mem = GuestMemory::new(GUEST_MEMORY_SIZE).unwrap();
        Exceptions::init(&mut mem).unwrap();
        // #PF: push 0xe; out 0xe0, al; hlt
        let mut stub = [0; 5];
        mem.read(Exceptions::stub_addr(14), &mut stub).unwrap();
        assert_eq!(stub, [0x6a, 0x0e, 0xe6, 0xe0, 0xf4]);
        let mut iretq = [0; 2];
        mem.read(IRETQ_ADDR, &mut iretq).unwrap();
        assert_eq!(iretq, [0x48, 0xcf]);
        let low = mem.read_qword(IDT_ADDR + 16 * 14).unwrap();
        assert_eq!(low & 0xffff, Exceptions::stub_addr(14) & 0xffff);
        assert_eq!((low >> 40) & 0xff, 0x8e);
    }

    #[test]
    fn exceptions_read_trap_frame() {
        let mut mem = GuestMemory::new(GUEST_MEMORY_SIZE).unwrap();
        let words = [0xd, 0x18, SANDBOX_VIRT_ADDR, 0x1b, 0x102, 0, 0x23];
        for (i, w) in words.iter().enumerate() {
            mem.write_qword(TRAP_KERNEL_RSP + 8 * i as u64, *w).unwrap();
        }
        let regs = kvm_regs {
            rsp: TRAP_KERNEL_RSP,
            rdi: 0x41,
            ..Default::default()
        };
        let frame = Exceptions::read_trap_frame(&mem, &regs, 0).unwrap();
        assert_eq!(frame.vector(), Vector::GeneralProtection);
        assert_eq!(frame.error_code, 0x18);
        assert_eq!(frame.rip, SANDBOX_VIRT_ADDR);
        assert!(frame.is_user());
        assert_eq!(frame.regs.rdi, 0x41);
        assert_eq!(frame.kernel_rsp, TRAP_KERNEL_RSP);

        mem.write_qword(TRAP_KERNEL_RSP, 0x40).unwrap();
        assert_eq!(
            Exceptions::read_trap_frame(&mem, &regs, 0),
            Err(Error::Exception(ExceptionError::InvalidVector(0x40)))
        );
    }
}
