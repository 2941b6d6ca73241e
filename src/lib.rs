//! KVM-hosted x86-64 instruction space explorer.
//!
//! The explorer walks the instruction space one candidate at a time and lets the CPU tell how
//! long every instruction is, and which exception it raises, by executing it in ring 3 at the
//! end of a page followed by an unmapped page. Changes in length or exception are printed as a
//! line-oriented log, optionally cross-checked against Capstone to find disassembler bugs and
//! undocumented instructions.
//!
//! ## Internals
//!
//! It is recommended to read the documentation in the following order.
//!
//! 1. [Guest Memory and Layout](memory)
//! 2. [Exception Handling](exceptions::Exceptions)
//!     1. [Trap Path](exceptions::TrapPath)
//! 3. [CPU Features](cpu::CpuFeatures)
//! 4. [Instruction-Length Oracle](oracle)
//! 5. [Search Engine](search::SearchEngine)
//! 6. [Decoder Cross-Check](disasm::Decoder)
//! 7. Explorer's Core
//!     1. [Executor](core::Executor)
//!     2. [Explorer](core::Explorer)
//! 8. [Output Format](output)
//! 9. [Fatal Reports](crash::FatalReport)
//! 10. [Config](config::Config)
//!
//! ## Getting Started
//!
//! ### Prerequisites
//!
//! - A Linux host with KVM enabled and read/write access to `/dev/kvm`.
//! - Cmake and a C++ compiler, needed to build Keystone and Capstone.
//!
//! ### Running
//!
//! The binary takes `key=value` arguments, the same way the options would be given on a kernel
//! command line:
//!
//! ```console
//! insnprobe prefixes=1 stop_after=100000 decoder=1 > probes.log
//! ```
//!
//! | Key               | Default | Meaning                                               |
//! |-------------------|---------|-------------------------------------------------------|
//! | `prefixes`        | `0`     | Maximum number of legacy prefixes per candidate.      |
//! | `stop_after`      | `0`     | Number of candidates to probe, `0` means unlimited.   |
//! | `used_prefixes`   | `0x1f`  | Bitmask of the prefix groups that may be generated.   |
//! | `detect_prefixes` | `0x1f`  | Bitmask of the prefix groups recognized as prefixes.  |
//! | `decoder`         | `1`     | Cross-check every reported probe with Capstone.       |
//! | `self_test`       | `1`     | Check the oracle on known instructions first.         |
//! | `report_dir`      | none    | Directory where fatal reports are stored.             |
//!
//! Prefix group bits are, from bit 0: lock/repeat, segment override, operand-size override,
//! address-size override and REX.
//!
//! A log can then be analyzed offline, which prints the instructions Capstone disagrees with:
//!
//! ```console
//! insnprobe analyze < probes.log
//! ```
//!
//! Diagnostics are logged with `tracing` and filtered with `RUST_LOG` (e.g. `RUST_LOG=debug`
//! logs every probe).

pub mod config;
pub mod core;
pub mod cpu;
pub mod crash;
pub mod disasm;
pub mod error;
pub mod exceptions;
pub mod memory;
pub mod oracle;
pub mod output;
pub mod search;
pub mod utils;

pub extern crate kvm_ioctls;
