//! The core components that set up the guest and drive the exploration.

use std::io::Write;

use kvm_bindings::{
    kvm_dtable, kvm_fpu, kvm_regs, kvm_sregs, kvm_userspace_memory_region, kvm_xcrs,
    KVM_MAX_CPUID_ENTRIES,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use tracing::{debug, error, info};

use crate::config::*;
use crate::cpu::*;
use crate::crash::*;
use crate::disasm::*;
use crate::error::*;
use crate::exceptions::*;
use crate::memory::*;
use crate::oracle::*;
use crate::output::*;
use crate::search::*;

thread_local!(
    /// A per-thread global keystone instance used to assemble x86-64 instructions.
    pub static KSE: keystone_engine::Keystone = keystone_engine::Keystone::new(
        keystone_engine::Arch::X86,
        keystone_engine::Mode::MODE_64,
    )
    .expect("Could not initialize Keystone engine");
    /// A per-thread global capstone instance used to disassemble x86-64 instructions.
    pub static CSE: capstone::Capstone = capstone::Capstone::new_raw(
        capstone::Arch::X86,
        capstone::Mode::Mode64,
        capstone::NO_EXTRA_MODE,
        None,
    )
    .expect("Could not initialize Capstone engine");
);

// -----------------------------------------------------------------------------------------------
// Core - Control Registers
// -----------------------------------------------------------------------------------------------

const CR0_PE: u64 = 1 << 0;
const CR0_MP: u64 = 1 << 1;
const CR0_ET: u64 = 1 << 4;
const CR0_NE: u64 = 1 << 5;
const CR0_WP: u64 = 1 << 16;
const CR0_AM: u64 = 1 << 18;
const CR0_PG: u64 = 1 << 31;

const CR4_PAE: u64 = 1 << 5;
const CR4_OSFXSR: u64 = 1 << 9;
const CR4_OSXMMEXCPT: u64 = 1 << 10;
const CR4_OSXSAVE: u64 = 1 << 18;
const CR4_SMEP: u64 = 1 << 20;

const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;
const EFER_NXE: u64 = 1 << 11;

const XCR0_X87: u64 = 1 << 0;
const XCR0_SSE: u64 = 1 << 1;
const XCR0_AVX: u64 = 1 << 2;

/// Reserved bit 1 of RFLAGS, always set.
const RFLAGS_FIXED: u64 = 1 << 1;
/// Trap flag.
const RFLAGS_TF: u64 = 1 << 8;

/// Interrupt frame consumed by the `iretq` trampoline, right below the top of the kernel stack.
const ENTRY_FRAME_ADDR: u64 = KERNEL_STACK_TOP - 5 * 8;

// -----------------------------------------------------------------------------------------------
// Core - Executor
// -----------------------------------------------------------------------------------------------

/// The KVM-backed sandbox.
///
/// # Executor
///
/// The executor owns a single-vCPU virtual machine whose memory holds a minimal 64-bit kernel:
/// descriptor tables, exception stubs, page tables and the sandbox page (see
/// [`crate::memory`] for the layout).
///
/// Every call to [`Sandbox::execute_user`] goes through the following steps:
///
///  1. the general purpose, segment, control and floating point registers are reset, so nothing
///     done by a previous probe (`std`, `mov ds, eax`, `fninit`, ...) leaks into the next one;
///  2. an interrupt frame targeting the sandbox in ring 3 with the trap flag set is written on
///     the kernel stack, and the vCPU starts at the `iretq` trampoline;
///  3. the instruction either faults or completes and single-steps, and the CPU enters the
///     exception stub of the vector on the TSS stack;
///  4. the stub reports the vector through [`TRAP_PORT`], the trap frame is read back from the
///     kernel stack and handed to the [`TrapPath`].
///
/// Anything else that makes the vCPU exit is kernel-fatal and halts the executor for good.
pub struct Executor {
    /// The vCPU running the guest.
    vcpu: VcpuFd,
    /// The virtual machine. Must be dropped before the memory backing it.
    _vm: VmFd,
    /// The hypervisor handle.
    _kvm: Kvm,
    /// Guest physical memory.
    memory: GuestMemory,
    /// Decides what happens to every trap.
    trap_path: TrapPath,
    /// Features of the CPU.
    features: CpuFeatures,
    /// Vendor and signature of the CPU.
    signature: CpuSignature,
    /// The fault that halted the executor, if any.
    fatal: Option<FatalFault>,
}

impl Executor {
    /// Creates the virtual machine and writes the guest kernel into its memory.
    pub fn new() -> Result<Self> {
        let kvm = Kvm::new()?;
        let vm = kvm.create_vm()?;
        let mut memory = GuestMemory::new(GUEST_MEMORY_SIZE)?;
        memory.init_kernel_structures()?;
        Exceptions::init(&mut memory)?;
        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: memory.size() as u64,
            userspace_addr: memory.host_addr(),
        };
        // SAFETY: the region is backed by `memory`, which outlives the virtual machine.
        unsafe { vm.set_user_memory_region(region)? };
        let vcpu = vm.create_vcpu(0)?;
        let cpuid = kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)?;
        vcpu.set_cpuid2(&cpuid)?;
        let features = CpuFeatures::from_cpuid(cpuid.as_slice());
        let signature = CpuSignature::from_cpuid(cpuid.as_slice());
        if features.can_enable_avx() {
            let mut xcrs = kvm_xcrs {
                nr_xcrs: 1,
                ..Default::default()
            };
            xcrs.xcrs[0].xcr = 0;
            xcrs.xcrs[0].value = XCR0_X87 | XCR0_SSE | XCR0_AVX;
            vcpu.set_xcrs(&xcrs)?;
        }
        info!(cpu = %signature, ?features, "virtual machine created");
        Ok(Self {
            vcpu,
            _vm: vm,
            _kvm: kvm,
            memory,
            trap_path: TrapPath::new(),
            features,
            signature,
            fatal: None,
        })
    }

    /// Returns `true` once a kernel-fatal fault happened.
    #[inline]
    pub fn is_halted(&self) -> bool {
        self.fatal.is_some()
    }

    /// System registers of the guest kernel.
    fn kernel_sregs(&self) -> Result<kvm_sregs> {
        let mut sregs = self.vcpu.get_sregs()?;
        let segment = |flags| SegmentDescriptor::new(flags, 0, 0xfffff);
        sregs.cs = segment(GDT_FLAGS_KERNEL_CODE).to_kvm_segment(KERNEL_CS);
        sregs.ss = segment(GDT_FLAGS_KERNEL_DATA).to_kvm_segment(KERNEL_DS);
        let user_data = segment(GDT_FLAGS_USER_DATA).to_kvm_segment(USER_DS);
        sregs.ds = user_data;
        sregs.es = user_data;
        sregs.fs = user_data;
        sregs.gs = user_data;
        let [tss, _] = tss_descriptor(TSS_ADDR, TSS_SIZE as u32 - 1);
        sregs.tr = tss.to_kvm_segment(TSS_SELECTOR);
        sregs.gdt = kvm_dtable {
            base: GDT_ADDR,
            limit: (GDT_NB_ENTRIES * 8 - 1) as u16,
            padding: [0; 3],
        };
        sregs.idt = kvm_dtable {
            base: IDT_ADDR,
            limit: (NB_VECTORS * 16 - 1) as u16,
            padding: [0; 3],
        };
        sregs.cr0 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG;
        sregs.cr2 = 0;
        sregs.cr3 = PML4_ADDR;
        sregs.cr4 = CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT;
        if self.features.can_enable_avx() {
            sregs.cr4 |= CR4_OSXSAVE;
        }
        if self.features.has_smep {
            sregs.cr4 |= CR4_SMEP;
        }
        sregs.efer = EFER_LME | EFER_LMA;
        if self.features.has_nx {
            sregs.efer |= EFER_NXE;
        }
        Ok(sregs)
    }

    /// Resets the vCPU and prepares the ring 3 entry at `rip`.
    fn prepare_entry(&mut self, rip: u64) -> Result<()> {
        let frame = [
            rip,
            USER_CS as u64,
            RFLAGS_FIXED | RFLAGS_TF,
            0,
            USER_DS as u64,
        ];
        for (i, word) in frame.iter().enumerate() {
            self.memory
                .write_qword(ENTRY_FRAME_ADDR + 8 * i as u64, *word)?;
        }
        let sregs = self.kernel_sregs()?;
        self.vcpu.set_sregs(&sregs)?;
        self.vcpu.set_regs(&kvm_regs {
            rip: IRETQ_ADDR,
            rsp: ENTRY_FRAME_ADDR,
            rflags: RFLAGS_FIXED,
            ..Default::default()
        })?;
        self.vcpu.set_fpu(&kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        })?;
        Ok(())
    }

    /// Runs the vCPU until it exits, and turns the exit into a trap outcome.
    fn vcpu_run(&mut self) -> Result<TrapOutcome> {
        let unexpected = match self.vcpu.run()? {
            VcpuExit::IoOut(TRAP_PORT, _) => None,
            VcpuExit::IoOut(port, _) => Some(format!("Unexpected write to I/O port {:#x}", port)),
            VcpuExit::IoIn(port, _) => Some(format!("Unexpected read from I/O port {:#x}", port)),
            VcpuExit::MmioRead(addr, _) | VcpuExit::MmioWrite(addr, _) => {
                Some(format!("Unexpected MMIO access at {:#x}", addr))
            }
            VcpuExit::Hlt => Some("Unexpected halt".to_string()),
            VcpuExit::Shutdown => Some("Triple fault".to_string()),
            VcpuExit::FailEntry(reason, _) => Some(format!("VM entry failure ({:#x})", reason)),
            exit => Some(format!("Unexpected exit: {:?}", exit)),
        };
        if let Some(title) = unexpected {
            let regs = self.vcpu.get_regs()?;
            self.trap_path = TrapPath::new();
            return Ok(TrapOutcome::Fatal(FatalFault {
                title: format!("{} (rip: {:#x})", title, regs.rip),
                frame: None,
            }));
        }
        let regs = self.vcpu.get_regs()?;
        let sregs = self.vcpu.get_sregs()?;
        match Exceptions::read_trap_frame(&self.memory, &regs, sregs.cr2) {
            Ok(frame) => Ok(self.trap_path.dispatch(frame)),
            Err(e) => {
                self.trap_path = TrapPath::new();
                Ok(TrapOutcome::Fatal(FatalFault {
                    title: format!("Unreadable exception frame: {}", e),
                    frame: None,
                }))
            }
        }
    }

    /// Halts the executor on `fault`.
    fn halt(&mut self, fault: FatalFault) -> Error {
        error!(title = %fault.title, "kernel-fatal fault");
        let title = fault.title.clone();
        self.fatal = Some(fault);
        CoreError::Fatal(title).into()
    }
}

impl Sandbox for Executor {
    fn page_addr(&self) -> u64 {
        SANDBOX_VIRT_ADDR
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset + data.len() > PAGE_SIZE {
            return Err(MemoryError::OutOfBounds(
                SANDBOX_VIRT_ADDR + offset as u64,
                data.len(),
            ))?;
        }
        self.memory.write(SANDBOX_PHYS_ADDR + offset as u64, data)
    }

    fn execute_user(&mut self, rip: u64) -> Result<TrapFrame> {
        if self.is_halted() {
            return Err(CoreError::Halted)?;
        }
        self.prepare_entry(rip)?;
        self.trap_path.arm(ReturnPoint {
            kernel_rsp: TRAP_KERNEL_RSP,
        });
        match self.vcpu_run()? {
            TrapOutcome::Resume(frame) => Ok(frame),
            TrapOutcome::Fatal(fault) => Err(self.halt(fault)),
        }
    }

    fn features(&self) -> CpuFeatures {
        self.features
    }

    fn signature(&self) -> CpuSignature {
        self.signature.clone()
    }

    fn fatal_fault(&self) -> Option<&FatalFault> {
        self.fatal.as_ref()
    }

    fn dump_page(&self) -> Result<String> {
        self.memory
            .hexdump(SANDBOX_PHYS_ADDR, PAGE_SIZE, SANDBOX_VIRT_ADDR)
    }
}

// -----------------------------------------------------------------------------------------------
// Core - Explorer
// -----------------------------------------------------------------------------------------------

/// Statistics of an exploration.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ExplorerInfo {
    /// Number of probed candidates.
    pub probes: u64,
    /// Number of probe records written.
    pub reported: u64,
    /// Verdicts of the reported records, when the decoder is enabled.
    pub verdicts: VerdictCounts,
}

/// Walks the instruction space and reports every change of length or exception.
///
/// The explorer asks the [`SearchEngine`] for candidates and the oracle for their length. When a
/// candidate's outcome differs from the previous one, it's written to the output and the search
/// moves its active byte to the end of the new instruction. Otherwise the same byte keeps being
/// incremented, which skips the immediates and displacements of an instruction already seen.
pub struct Explorer<S: Sandbox, W: Write> {
    sandbox: S,
    config: Config,
    output: OutputDevice<W>,
}

impl<S: Sandbox, W: Write> Explorer<S, W> {
    /// Creates an explorer.
    pub fn new(sandbox: S, config: Config, output: W) -> Self {
        Self {
            sandbox,
            config,
            output: OutputDevice::new(output),
        }
    }

    /// Returns the sandbox.
    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    /// Returns the underlying output writer.
    pub fn into_output(self) -> W {
        self.output.into_inner()
    }

    /// Checks the oracle, and the decoder if enabled, against instructions of known length.
    pub fn self_test(&mut self) -> Result<()> {
        self.output.message("Executing self test.")?;
        let failures = self_test_lengths(&mut self.sandbox)?;
        for failure in failures.iter() {
            self.output.line(format_args!("!!! {}", failure))?;
        }
        if !failures.is_empty() {
            self.output.line("Instruction length: b0rken!")?;
            return Err(CoreError::SelfTestFailed("instruction length".to_string()))?;
        }
        self.output.line("Instruction length: OK")?;
        if self.config.decoder() {
            if !Decoder::self_test()? {
                self.output.line("Capstone: b0rken!")?;
                return Err(CoreError::SelfTestFailed("capstone".to_string()))?;
            }
            self.output.line("Capstone: OK")?;
        }
        Ok(())
    }

    /// Runs the self tests if enabled, then explores the instruction space until it's exhausted
    /// or `stop_after` candidates have been probed.
    pub fn run(&mut self) -> Result<ExplorerInfo> {
        let mut search = SearchEngine::new(
            self.config.prefixes(),
            self.config.used_prefixes(),
            self.config.detect_prefixes(),
        );
        let ret = self.explore(&mut search);
        if let Err(e) = &ret {
            error!(error = %e, candidate = %search.candidate(), "exploration aborted");
            self.report_fatal(*search.candidate())?;
        }
        self.output.flush()?;
        ret
    }

    fn explore(&mut self, search: &mut SearchEngine) -> Result<ExplorerInfo> {
        self.output
            .message(format_args!("CPU is {}.", self.sandbox.signature()))?;
        if self.config.self_test() {
            self.self_test()?;
        }
        let prefixes = self.config.prefixes();
        self.output.message(format_args!(
            "Probing instruction space with up to {} legacy {}.",
            prefixes,
            if prefixes == 1 { "prefix" } else { "prefixes" }
        ))?;
        if let Some(stop_after) = self.config.stop_after() {
            self.output
                .message(format_args!("Stopping after {} execution attempts.", stop_after))?;
        }
        info!(
            prefixes = self.config.prefixes(),
            stop_after = ?self.config.stop_after(),
            "exploration started"
        );
        let mut info = ExplorerInfo::default();
        let mut last = ExecutionAttempt::default();
        loop {
            let candidate = *search.candidate();
            let attempt = find_instruction_length(&mut self.sandbox, &candidate)?;
            debug!(%candidate, %attempt, position = search.increment_position(), "probe");
            search.clear_after(attempt.length);
            if is_interesting_change(&last, &attempt) {
                search.start_over(attempt.length);
                let record = self.record(candidate, attempt)?;
                self.output.probe(&record)?;
                info.reported += 1;
                if let Some(crosscheck) = &record.crosscheck {
                    info.verdicts.add(crosscheck.verdict);
                }
            }
            last = attempt;
            info.probes += 1;
            if Some(info.probes) == self.config.stop_after() || !search.find_next_candidate() {
                break;
            }
        }
        self.output.message("Done!")?;
        info!(
            probes = info.probes,
            reported = info.reported,
            bugs = info.verdicts.bug,
            "exploration done"
        );
        Ok(info)
    }

    /// Builds the record of a reported probe.
    fn record(
        &self,
        candidate: InstructionCandidate,
        attempt: ExecutionAttempt,
    ) -> Result<ProbeRecord> {
        let crosscheck = match self.config.decoder() && attempt.is_complete() {
            true => Some(Decoder::crosscheck(candidate.bytes(), &attempt)?),
            false => None,
        };
        Ok(ProbeRecord {
            candidate,
            attempt,
            crosscheck,
        })
    }

    /// Writes the report of the fault that halted the sandbox, if any, and stores it when a
    /// report directory is configured.
    fn report_fatal(&mut self, candidate: InstructionCandidate) -> Result<()> {
        let fault = match self.sandbox.fatal_fault() {
            Some(fault) => fault.clone(),
            None => return Ok(()),
        };
        let mut report = FatalReport::new(fault).candidate(candidate);
        if let Ok(dump) = self.sandbox.dump_page() {
            report = report.sandbox_dump(dump);
        }
        self.output.fatal(&report)?;
        if let Some(dir) = self.config.report_directory() {
            let path = CrashHandler::new(dir)?.store_report(&report)?;
            info!(path = %path.display(), "fatal report stored");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::scripted::*;

    /// Creates an executor whose ring 0 stack pointer in the TSS was moved, so that the next trap
    /// frame isn't where the return point expects it. Returns `None` if KVM isn't usable.
    fn misconfigured_executor() -> Option<Executor> {
        let mut executor = match Executor::new() {
            Ok(executor) => executor,
            Err(Error::Hypervisor(e)) => {
                eprintln!("skipping, KVM is not available: {}", e);
                return None;
            }
            Err(e) => panic!("could not create the executor: {}", e),
        };
        executor
            .memory
            .write_qword(TSS_ADDR + 4, KERNEL_STACK_TOP - 0x1000)
            .unwrap();
        Some(executor)
    }

    fn explore(sandbox: ScriptedSandbox, config: Config) -> (Result<ExplorerInfo>, String) {
        let mut explorer = Explorer::new(sandbox, config, Vec::new());
        let ret = explorer.run();
        let output = String::from_utf8(explorer.into_output()).unwrap();
        (ret, output)
    }

    #[test]
    fn core_explorer_run() {
        let config = Config::builder()
            .decoder(false)
            .stop_after(Some(3))
            .build();
        let (ret, output) = explore(ScriptedSandbox::new(default_model), config);
        assert_eq!(
            ret.unwrap(),
            ExplorerInfo {
                probes: 3,
                reported: 1,
                verdicts: VerdictCounts::default(),
            }
        );
        assert_eq!(
            output,
            "\
>>> CPU is GenuineIntel 000906ea.
>>> Executing self test.
Instruction length: OK
>>> Probing instruction space with up to 0 legacy prefixes.
>>> Stopping after 3 execution attempts.
EXC 0E OK | 00 00
>>> Done!
"
        );
    }

    #[test]
    fn core_explorer_prefix_count_message() {
        for (prefixes, message) in [
            (1, ">>> Probing instruction space with up to 1 legacy prefix.\n"),
            (2, ">>> Probing instruction space with up to 2 legacy prefixes.\n"),
        ] {
            let config = Config::builder()
                .decoder(false)
                .self_test(false)
                .prefixes(prefixes)
                .stop_after(Some(1))
                .build();
            let (ret, output) = explore(ScriptedSandbox::new(default_model), config);
            assert!(ret.is_ok());
            assert!(output.contains(message), "{}", output);
        }
    }

    #[test]
    fn core_explorer_reports_changes() {
        // `00 xx` is two bytes long until the second byte reaches 0x0f, where the model turns it
        // into a three byte instruction raising #UD.
        fn model(bytes: &[u8]) -> (usize, Behavior) {
            match bytes {
                [0x00, b, ..] if *b >= 0x0f => (3, Behavior::Fault(6)),
                _ => default_model(bytes),
            }
        }
        let config = Config::builder()
            .decoder(false)
            .self_test(false)
            .stop_after(Some(0x20))
            .build();
        let (ret, output) = explore(ScriptedSandbox::new(model), config);
        let info = ret.unwrap();
        assert_eq!(info.probes, 0x20);
        assert_eq!(info.reported, 2);
        let records = output
            .lines()
            .filter_map(|l| l.parse::<ProbeRecord>().ok())
            .map(|r| r.to_string())
            .collect::<Vec<_>>();
        assert_eq!(records, vec!["EXC 0E OK | 00 00", "EXC 06 OK | 00 0F 00"]);
    }

    #[test]
    fn core_explorer_decoder() {
        let config = Config::builder().stop_after(Some(1)).build();
        let (ret, output) = explore(ScriptedSandbox::new(default_model), config);
        let info = ret.unwrap();
        assert_eq!(info.verdicts.ok, 1);
        assert!(output.contains("Capstone: OK\n"));
        assert!(output.contains("EXC 0E OK | 00 00 | OK 02 add byte ptr [rax], al\n"));
    }

    #[test]
    fn core_explorer_self_test_failure() {
        fn model(bytes: &[u8]) -> (usize, Behavior) {
            match bytes.first() {
                Some(0x90) => (2, Behavior::Step),
                _ => default_model(bytes),
            }
        }
        let config = Config::builder().decoder(false).build();
        let (ret, output) = explore(ScriptedSandbox::new(model), config);
        assert_eq!(
            ret,
            Err(CoreError::SelfTestFailed("instruction length".to_string()).into())
        );
        assert!(output.contains("!!! 90 expected 1 bytes, got 2 bytes"));
        assert!(output.ends_with("Instruction length: b0rken!\n"));
    }

    #[test]
    fn core_explorer_fatal_fault() {
        let mut sandbox = ScriptedSandbox::new(default_model);
        sandbox.fatal_at = Some(2);
        let dir = std::env::temp_dir().join(format!("insnprobe-fatal-{}", std::process::id()));
        let config = Config::builder()
            .decoder(false)
            .self_test(false)
            .report_directory(&dir)
            .build();
        let mut explorer = Explorer::new(sandbox, config, Vec::new());
        let ret = explorer.run();
        assert_eq!(
            ret,
            Err(CoreError::Fatal("Exception in kernel mode".to_string()).into())
        );
        assert!(explorer.sandbox().fatal_fault().is_some());
        // The sandbox stays halted.
        assert_eq!(explorer.run(), Err(CoreError::Halted.into()));
        let output = String::from_utf8(explorer.into_output()).unwrap();
        assert!(output.contains("!!! Exception in kernel mode\n"));
        assert!(output.contains("!!! Candidate: 00 00"));
        assert!(!output.contains(">>> Done!"));
        let reports = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(reports, 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn core_executor_wrong_kernel_stack_is_fatal() {
        let Some(executor) = misconfigured_executor() else {
            return;
        };
        let config = Config::builder()
            .decoder(false)
            .self_test(false)
            .build();
        let mut explorer = Explorer::new(executor, config, Vec::new());
        let ret = explorer.run();
        assert_eq!(
            ret,
            Err(CoreError::Fatal(
                "Exception frame outside of the sandbox return stack".to_string()
            )
            .into())
        );
        assert!(explorer.sandbox().is_halted());
        let fault = explorer.sandbox().fatal_fault().unwrap().clone();
        assert_eq!(
            fault.frame.unwrap().kernel_rsp,
            TRAP_KERNEL_RSP - 0x1000
        );
        let output = String::from_utf8(explorer.into_output()).unwrap();
        assert!(output.contains("!!! Exception frame outside of the sandbox return stack\n"));
        assert!(output.contains("!!! Sandbox page:\n"));
    }

    #[test]
    fn core_executor_halted_stays_halted() {
        let Some(mut executor) = misconfigured_executor() else {
            return;
        };
        let rip = SANDBOX_VIRT_ADDR + PAGE_SIZE as u64 - 1;
        executor.write(PAGE_SIZE - 1, &[0x90]).unwrap();
        assert!(matches!(
            executor.execute_user(rip),
            Err(Error::Core(CoreError::Fatal(_)))
        ));
        assert_eq!(executor.execute_user(rip), Err(CoreError::Halted.into()));
    }
}
