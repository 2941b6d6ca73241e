// -----------------------------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use insnprobe::config::*;
    use insnprobe::core::*;
    use insnprobe::error::*;
    use insnprobe::exceptions::*;
    use insnprobe::memory::*;
    use insnprobe::oracle::*;
    use insnprobe::search::*;

    /// Creates an executor, or returns `None` if KVM isn't usable on this machine.
    fn executor() -> Option<Executor> {
        match Executor::new() {
            Ok(executor) => Some(executor),
            Err(Error::Hypervisor(e)) => {
                eprintln!("skipping, KVM is not available: {}", e);
                None
            }
            Err(e) => panic!("could not create the executor: {}", e),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Sandbox

    #[test]
    fn sandbox_single_step() {
        let Some(mut executor) = executor() else {
            return;
        };
        let rip = SANDBOX_VIRT_ADDR + PAGE_SIZE as u64 - 2;
        executor.write(PAGE_SIZE - 2, &[0x90, 0x90]).unwrap();
        let frame = executor.execute_user(rip).unwrap();
        assert_eq!(frame.vector(), Vector::Debug);
        assert_eq!(frame.rip, rip + 1);
        assert!(frame.is_user());
        assert_eq!(frame.kernel_rsp, TRAP_KERNEL_RSP);
    }

    #[test]
    fn sandbox_registers_at_trap() {
        let Some(mut executor) = executor() else {
            return;
        };
        let rip = SANDBOX_VIRT_ADDR + PAGE_SIZE as u64 - 1;
        executor.write(PAGE_SIZE - 1, &[0x90]).unwrap();
        let frame = executor.execute_user(rip).unwrap();
        assert_eq!(frame.vector(), Vector::Debug);
        assert_eq!(frame.regs.rax, 0);
        // mov eax, 0x1234
        let code = [0xb8, 0x34, 0x12, 0x00, 0x00];
        let offset = PAGE_SIZE - code.len();
        executor.write(offset, &code).unwrap();
        let frame = executor
            .execute_user(SANDBOX_VIRT_ADDR + offset as u64)
            .unwrap();
        assert_eq!(frame.vector(), Vector::Debug);
        assert_eq!(frame.regs.rax, 0x1234);
    }

    #[test]
    fn sandbox_fetch_fault() {
        let Some(mut executor) = executor() else {
            return;
        };
        let rip = SANDBOX_VIRT_ADDR + PAGE_SIZE as u64 - 1;
        executor.write(PAGE_SIZE - 1, &[0xe9]).unwrap();
        let frame = executor.execute_user(rip).unwrap();
        assert_eq!(frame.vector(), Vector::PageFault);
        assert_eq!(frame.cr2, SANDBOX_VIRT_ADDR + PAGE_SIZE as u64);
        assert_eq!(frame.rip, rip);
        assert!(is_incomplete_fetch(
            &frame,
            rip,
            SANDBOX_VIRT_ADDR,
            &executor.features()
        ));
    }

    #[test]
    fn sandbox_privileged_instruction() {
        let Some(mut executor) = executor() else {
            return;
        };
        // hlt
        let rip = SANDBOX_VIRT_ADDR + PAGE_SIZE as u64 - 1;
        executor.write(PAGE_SIZE - 1, &[0xf4]).unwrap();
        let frame = executor.execute_user(rip).unwrap();
        assert_eq!(frame.vector(), Vector::GeneralProtection);
        assert!(!executor.is_halted());
    }

    #[test]
    fn sandbox_kernel_memory_is_protected() {
        let Some(mut executor) = executor() else {
            return;
        };
        // mov rax, [0x2000]
        let code = [0x48, 0x8b, 0x04, 0x25, 0x00, 0x20, 0x00, 0x00];
        let offset = PAGE_SIZE - code.len();
        executor.write(offset, &code).unwrap();
        let frame = executor
            .execute_user(SANDBOX_VIRT_ADDR + offset as u64)
            .unwrap();
        assert_eq!(frame.vector(), Vector::PageFault);
        assert_eq!(frame.cr2, IDT_ADDR);
    }

    #[test]
    fn sandbox_write_out_of_page() {
        let Some(mut executor) = executor() else {
            return;
        };
        assert!(executor.write(PAGE_SIZE - 1, &[0x90, 0x90]).is_err());
    }

    // -------------------------------------------------------------------------------------------
    // Oracle

    #[test]
    fn oracle_reference_lengths() {
        let Some(mut executor) = executor() else {
            return;
        };
        let failures = self_test_lengths(&mut executor).unwrap();
        assert!(failures.is_empty(), "{:?}", failures);
    }

    #[test]
    fn oracle_idempotent() {
        let Some(mut executor) = executor() else {
            return;
        };
        for &(bytes, _) in LENGTH_SELF_TESTS {
            let candidate = InstructionCandidate::new(bytes);
            let first = find_instruction_length(&mut executor, &candidate).unwrap();
            let second = find_instruction_length(&mut executor, &candidate).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn oracle_ud2() {
        let Some(mut executor) = executor() else {
            return;
        };
        let candidate = InstructionCandidate::new(&[0x0f, 0x0b]);
        let attempt = find_instruction_length(&mut executor, &candidate).unwrap();
        assert_eq!(
            attempt,
            ExecutionAttempt {
                length: 2,
                exception: 6,
            }
        );
    }

    // -------------------------------------------------------------------------------------------
    // Explorer

    #[test]
    fn explorer_first_candidates() {
        let Some(executor) = executor() else {
            return;
        };
        let config = Config::builder()
            .decoder(false)
            .stop_after(Some(0x100))
            .build();
        let mut explorer = Explorer::new(executor, config, Vec::new());
        let info = explorer.run().unwrap();
        assert_eq!(info.probes, 0x100);
        let output = String::from_utf8(explorer.into_output()).unwrap();
        assert!(output.contains("Instruction length: OK\n"));
        // add [rax], al
        assert!(output.contains("EXC 0E OK | 00 00\n"));
        assert!(output.ends_with(">>> Done!\n"));
    }
}
