//! Enumerates instruction candidates in a deterministic, pruned order.

use std::fmt;

use crate::utils::*;

/// Maximum length of an x86 instruction.
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

// -----------------------------------------------------------------------------------------------
// Search - Candidates
// -----------------------------------------------------------------------------------------------

/// A raw set of bytes that potentially represents an instruction.
///
/// Candidates are compared and ordered like big-endian numbers, which is also the order in which
/// the [`SearchEngine`] enumerates them.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InstructionCandidate {
    raw: [u8; MAX_INSTRUCTION_LENGTH],
}

impl InstructionCandidate {
    /// Creates a candidate from `bytes`, padded with zeroes. Bytes beyond
    /// [`MAX_INSTRUCTION_LENGTH`] are ignored.
    pub fn new(bytes: &[u8]) -> Self {
        let mut raw = [0; MAX_INSTRUCTION_LENGTH];
        let len = std::cmp::min(bytes.len(), MAX_INSTRUCTION_LENGTH);
        raw[..len].copy_from_slice(&bytes[..len]);
        Self { raw }
    }

    /// Returns all the bytes of the candidate, including trailing zeroes.
    #[inline]
    pub fn bytes(&self) -> &[u8; MAX_INSTRUCTION_LENGTH] {
        &self.raw
    }

    /// Returns the first `len` bytes of the candidate.
    #[inline]
    pub fn prefix(&self, len: usize) -> &[u8] {
        &self.raw[..std::cmp::min(len, MAX_INSTRUCTION_LENGTH)]
    }
}

impl From<[u8; MAX_INSTRUCTION_LENGTH]> for InstructionCandidate {
    fn from(raw: [u8; MAX_INSTRUCTION_LENGTH]) -> Self {
        Self { raw }
    }
}

impl fmt::Debug for InstructionCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstructionCandidate([{}])", hex_bytes(&self.raw))
    }
}

impl fmt::Display for InstructionCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_bytes(&self.raw))
    }
}

// -----------------------------------------------------------------------------------------------
// Search - Prefix Groups
// -----------------------------------------------------------------------------------------------

/// Legacy prefix groups, in their canonical order.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum PrefixGroup {
    /// `LOCK`, `REPNE` and `REP`.
    LockRep = 0,
    /// `CS`, `SS`, `DS`, `ES`, `FS` and `GS` overrides.
    Segment = 1,
    /// Operand-size override.
    OperandSize = 2,
    /// Address-size override.
    AddressSize = 3,
    /// `REX` prefixes.
    Rex = 4,
}

impl PrefixGroup {
    /// Number of prefix groups.
    pub const COUNT: usize = 5;

    /// All groups in canonical order.
    pub const ALL: [PrefixGroup; Self::COUNT] = [
        PrefixGroup::LockRep,
        PrefixGroup::Segment,
        PrefixGroup::OperandSize,
        PrefixGroup::AddressSize,
        PrefixGroup::Rex,
    ];

    /// Returns the group of a byte, if it is a prefix.
    pub const fn from_byte(byte: u8) -> Option<PrefixGroup> {
        match byte {
            0xf0 | 0xf2 | 0xf3 => Some(PrefixGroup::LockRep),
            0x2e | 0x36 | 0x3e | 0x26 | 0x64 | 0x65 => Some(PrefixGroup::Segment),
            0x66 => Some(PrefixGroup::OperandSize),
            0x67 => Some(PrefixGroup::AddressSize),
            0x40..=0x4f => Some(PrefixGroup::Rex),
            _ => None,
        }
    }

    /// Index of the group in canonical order.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Bit of the group in a [`PrefixGroupSet`].
    #[inline]
    pub const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

const fn build_prefix_groups() -> [Option<PrefixGroup>; 256] {
    let mut table = [None; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = PrefixGroup::from_byte(i as u8);
        i += 1;
    }
    table
}

/// Byte value to prefix group classification, computed at compile time.
pub static PREFIX_GROUPS: [Option<PrefixGroup>; 256] = build_prefix_groups();

/// A set of prefix groups stored as a bitmask, bit `n` being the group of index `n`.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct PrefixGroupSet(u8);

impl PrefixGroupSet {
    /// All prefix groups.
    pub const ALL: PrefixGroupSet = PrefixGroupSet(0x1f);
    /// No prefix group.
    pub const NONE: PrefixGroupSet = PrefixGroupSet(0);

    /// Creates a set from a bitmask. Bits that don't match a group are ignored.
    pub fn from_bits(bits: u64) -> Self {
        Self((bits & Self::ALL.0 as u64) as u8)
    }

    /// Returns the underlying bitmask.
    #[inline]
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Returns `true` if `group` is part of the set.
    #[inline]
    pub fn contains(&self, group: PrefixGroup) -> bool {
        self.0 & group.bit() != 0
    }
}

impl Default for PrefixGroupSet {
    fn default() -> Self {
        Self::ALL
    }
}

impl FromIterator<PrefixGroup> for PrefixGroupSet {
    fn from_iter<I: IntoIterator<Item = PrefixGroup>>(iter: I) -> Self {
        Self(iter.into_iter().fold(0, |acc, g| acc | g.bit()))
    }
}

/// Prefix classification restricted to the groups we want to detect.
///
/// Bytes from undetected groups are treated as regular opcode bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrefixGroupLut {
    data: [Option<PrefixGroup>; 256],
}

impl PrefixGroupLut {
    /// Builds the lookup table for the groups in `detect`.
    pub fn new(detect: PrefixGroupSet) -> Self {
        let mut data = PREFIX_GROUPS;
        data.iter_mut()
            .filter(|g| matches!(g, Some(group) if !detect.contains(*group)))
            .for_each(|g| *g = None);
        Self { data }
    }

    /// Returns the group of `byte`.
    #[inline]
    pub fn group(&self, byte: u8) -> Option<PrefixGroup> {
        self.data[byte as usize]
    }
}

impl Default for PrefixGroupLut {
    fn default() -> Self {
        Self::new(PrefixGroupSet::ALL)
    }
}

/// Which prefixes a candidate starts with, where they are and how many there are.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PrefixState {
    /// Count of prefixes in each group.
    count: [u8; PrefixGroup::COUNT],
    /// Last position of a prefix of each group.
    position: [u8; PrefixGroup::COUNT],
}

impl PrefixState {
    /// Analyzes the run of prefix bytes at the start of `candidate`.
    pub fn analyze(lut: &PrefixGroupLut, candidate: &InstructionCandidate) -> Self {
        let mut state = Self::default();
        for (i, &byte) in candidate.bytes().iter().enumerate() {
            let group = match lut.group(byte) {
                Some(g) => g,
                None => break,
            };
            state.count[group.index()] += 1;
            state.position[group.index()] = i as u8;
        }
        state
    }

    /// Number of prefixes of `group`.
    #[inline]
    pub fn count(&self, group: PrefixGroup) -> usize {
        self.count[group.index()] as usize
    }

    /// Total number of prefix bytes.
    pub fn total_prefix_bytes(&self) -> usize {
        self.count.iter().map(|&c| c as usize).sum()
    }

    /// Returns `true` if any group appears more than once.
    pub fn has_duplicated_prefixes(&self) -> bool {
        self.count.iter().any(|&c| c >= 2)
    }

    /// Returns `true` if a group outside of `used` appears.
    pub fn has_unused_prefixes(&self, used: PrefixGroupSet) -> bool {
        PrefixGroup::ALL
            .iter()
            .any(|&g| self.count[g.index()] != 0 && !used.contains(g))
    }

    /// Returns `true` if groups appear in canonical order. Assumes there are no duplicated
    /// prefixes.
    pub fn has_ordered_prefixes(&self) -> bool {
        (0..PrefixGroup::COUNT).all(|i| {
            (i + 1..PrefixGroup::COUNT).all(|j| {
                !(self.count[i] != 0 && self.count[j] != 0 && self.position[i] > self.position[j])
            })
        })
    }
}

// -----------------------------------------------------------------------------------------------
// Search - Engine
// -----------------------------------------------------------------------------------------------

/// Produces the sequence of instruction candidates to probe.
///
/// # Enumeration Order
///
/// Candidates are enumerated by incrementing the byte at the *active position* like a big-endian
/// number restricted to the bytes on the left of that position (the rightmost active byte varies
/// fastest). When the byte at the active position wraps to zero, the active position moves one
/// byte to the left. The search is over when the leftmost byte wraps.
///
/// Once the real length of an instruction is known, the caller zeroes the bytes after it with
/// [`SearchEngine::clear_after`] and, if the result was interesting, moves the active position
/// back to the last byte of the instruction with [`SearchEngine::start_over`].
///
/// # Pruning
///
/// Raw enumeration of 15-byte candidates is not feasible. After each increment the legacy prefix
/// bytes at the start of the candidate are analyzed, and the candidate is skipped if:
///
///  * it has more prefix bytes than allowed;
///  * a prefix group appears more than once;
///  * a prefix group that is not in the *used* set appears;
///  * the prefix groups are not in canonical order ([`PrefixGroup::ALL`]).
#[derive(Clone, Debug)]
pub struct SearchEngine {
    /// The current candidate.
    current: InstructionCandidate,
    /// Index of the byte that is currently incremented.
    increment_at: usize,
    /// Maximum number of prefix bytes in a candidate.
    max_prefixes: usize,
    /// Prefix groups candidates are allowed to contain.
    used_prefixes: PrefixGroupSet,
    /// Prefix classification for the detected groups.
    group_lut: PrefixGroupLut,
    /// Set once the leftmost byte wrapped.
    exhausted: bool,
}

impl SearchEngine {
    /// Creates a search engine starting at the all-zero candidate.
    pub fn new(
        max_prefixes: usize,
        used_prefixes: PrefixGroupSet,
        detect_prefixes: PrefixGroupSet,
    ) -> Self {
        Self::with_start(
            max_prefixes,
            used_prefixes,
            detect_prefixes,
            InstructionCandidate::default(),
        )
    }

    /// Creates a search engine resuming from `start`, with the leftmost byte active.
    pub fn with_start(
        max_prefixes: usize,
        used_prefixes: PrefixGroupSet,
        detect_prefixes: PrefixGroupSet,
        start: InstructionCandidate,
    ) -> Self {
        Self {
            current: start,
            increment_at: 0,
            max_prefixes,
            used_prefixes,
            group_lut: PrefixGroupLut::new(detect_prefixes),
            exhausted: false,
        }
    }

    /// Returns the current candidate.
    #[inline]
    pub fn candidate(&self) -> &InstructionCandidate {
        &self.current
    }

    /// Returns the index of the byte currently being incremented.
    #[inline]
    pub fn increment_position(&self) -> usize {
        self.increment_at
    }

    /// Zeroes all the bytes from index `pos` onwards.
    pub fn clear_after(&mut self, pos: usize) {
        if pos < MAX_INSTRUCTION_LENGTH {
            self.current.raw[pos..].fill(0);
        }
    }

    /// Moves the active position to the last byte of an instruction of length `length`.
    pub fn start_over(&mut self, length: usize) {
        self.increment_at = length.clamp(1, MAX_INSTRUCTION_LENGTH) - 1;
    }

    /// Returns `true` if `candidate` passes the prefix pruning rules.
    pub fn is_permitted(&self, candidate: &InstructionCandidate) -> bool {
        let state = PrefixState::analyze(&self.group_lut, candidate);
        // Duplicated prefixes make the search space explode without generating insight. Order is
        // enforced to further reduce it.
        state.total_prefix_bytes() <= self.max_prefixes
            && !state.has_duplicated_prefixes()
            && !state.has_unused_prefixes(self.used_prefixes)
            && state.has_ordered_prefixes()
    }

    /// Advances to the next permitted candidate. Returns `false` once the search is over.
    pub fn find_next_candidate(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        loop {
            let byte = &mut self.current.raw[self.increment_at];
            *byte = byte.wrapping_add(1);
            if *byte == 0 {
                // Wrapped at the current position, continue on the byte to the left.
                if self.increment_at == 0 {
                    self.exhausted = true;
                    return false;
                }
                self.increment_at -= 1;
                continue;
            }
            if self.is_permitted(&self.current) {
                return true;
            }
        }
    }
}
