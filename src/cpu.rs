//! CPU identification and feature detection from the CPUID table exposed to the guest.

use kvm_bindings::kvm_cpuid_entry2;

use std::fmt;

use crate::utils::*;

/// Returns the CPUID entry for `function` and sub-leaf `index`, if the table has one.
fn leaf(entries: &[kvm_cpuid_entry2], function: u32, index: u32) -> Option<&kvm_cpuid_entry2> {
    entries
        .iter()
        .find(|e| e.function == function && e.index == index)
}

/// Features of the CPU that change how the guest is configured or how faults are classified.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CpuFeatures {
    /// Execute-disable is supported. Page faults then report instruction fetches.
    pub has_nx: bool,
    /// Supervisor-mode execution prevention is supported.
    pub has_smep: bool,
    /// `XSAVE` is supported.
    pub has_xsave: bool,
    /// AVX is supported.
    pub has_avx: bool,
}

impl CpuFeatures {
    /// Detects features from a CPUID table.
    pub fn from_cpuid(entries: &[kvm_cpuid_entry2]) -> Self {
        let ecx1 = leaf(entries, 1, 0).map(|e| e.ecx).unwrap_or(0);
        let ebx7 = leaf(entries, 7, 0).map(|e| e.ebx).unwrap_or(0);
        let edx_ext = leaf(entries, 0x8000_0001, 0).map(|e| e.edx).unwrap_or(0);
        Self {
            has_nx: bit(edx_ext, 20),
            has_smep: bit(ebx7, 7),
            has_xsave: bit(ecx1, 26),
            has_avx: bit(ecx1, 28),
        }
    }

    /// Returns `true` if the guest can enable AVX state through XCR0.
    pub fn can_enable_avx(&self) -> bool {
        self.has_xsave && self.has_avx
    }
}

/// Vendor and signature of the CPU.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CpuSignature {
    /// Vendor string (e.g. `GenuineIntel`).
    pub vendor: String,
    /// Family, model and stepping, as returned in `EAX` by leaf 1.
    pub signature: u32,
}

impl CpuSignature {
    /// Reads the signature from a CPUID table.
    pub fn from_cpuid(entries: &[kvm_cpuid_entry2]) -> Self {
        let vendor = leaf(entries, 0, 0)
            .map(|e| {
                [e.ebx, e.edx, e.ecx]
                    .iter()
                    .flat_map(|r| r.to_le_bytes())
                    .map(|b| b as char)
                    .collect::<String>()
            })
            .unwrap_or_default();
        let signature = leaf(entries, 1, 0).map(|e| e.eax).unwrap_or(0);
        Self { vendor, signature }
    }
}

impl fmt::Display for CpuSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:08x}", self.vendor, self.signature)
    }
}
