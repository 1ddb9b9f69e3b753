//! Memory-type range register lookup.
//!
//! The EPT engine needs a cacheability type for every large region it maps;
//! [`MemTypeOracle`] is that contract, and [`MtrrRanges`] is its
//! MSR-backed implementation: the fixed ranges below 1MB, the variable
//! base/mask pairs, and the default type, merged toward the most restrictive
//! type whenever a query spans conflicting ranges.

use alloc::vec::Vec;

use crate::{addressing::Pa, vmx::Msrs};

/// MSR - IA32_MTRRCAP.
pub const IA32_MTRRCAP: u32 = 0x0FE;
/// MSR - IA32_MTRR_DEF_TYPE.
pub const IA32_MTRR_DEF_TYPE: u32 = 0x2FF;
/// MSR - IA32_MTRR_PHYSBASE0; subsequent bases are 2 apart.
pub const IA32_MTRR_PHYSBASE0: u32 = 0x200;
/// MSR - IA32_MTRR_PHYSMASK0; subsequent masks are 2 apart.
pub const IA32_MTRR_PHYSMASK0: u32 = 0x201;

const MTRRCAP_FIXED_SUPPORT: u64 = 1 << 8;
const DEF_TYPE_FIXED_ENABLE: u64 = 1 << 10;
const DEF_TYPE_ENABLE: u64 = 1 << 11;
const PHYSMASK_VALID: u64 = 1 << 11;
const PHYS_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Sub-ranges per fixed-range register.
const FIXED_SUB_RANGE_COUNT: usize = 8;

/// Memory cacheability types, in their architectural encoding.
///
/// The numeric order doubles as a restrictiveness order: when ranges
/// conflict, the smaller encoding wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MemoryType {
    /// Uncacheable; the only type that is always safe.
    Uncacheable = 0,
    /// Write combining.
    WriteCombining = 1,
    /// Write through.
    WriteThrough = 4,
    /// Write protected.
    WriteProtected = 5,
    /// Write back; the default for ordinary memory.
    WriteBack = 6,
}

impl MemoryType {
    /// Decode an architectural memory-type number.
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(Self::Uncacheable),
            1 => Some(Self::WriteCombining),
            4 => Some(Self::WriteThrough),
            5 => Some(Self::WriteProtected),
            6 => Some(Self::WriteBack),
            _ => None,
        }
    }

    /// The architectural encoding.
    #[inline]
    pub fn bits(self) -> u64 {
        self as u64
    }
}

/// The cacheability oracle consumed by the EPT engine.
pub trait MemTypeOracle {
    /// The memory type of the physical range `[start, start + len)`.
    fn memory_type(&self, start: Pa, len: usize) -> MemoryType;
}

/// One fixed-range register: its mask MSR and the region it covers.
struct FixedRange {
    msr: u32,
    start: u64,
    sub_size: u64,
}

/// The 11 architectural fixed-range registers covering the first megabyte.
const FIXED_RANGES: [FixedRange; 11] = [
    FixedRange { msr: 0x250, start: 0x0_0000, sub_size: 0x1_0000 },
    FixedRange { msr: 0x258, start: 0x8_0000, sub_size: 0x4000 },
    FixedRange { msr: 0x259, start: 0xA_0000, sub_size: 0x4000 },
    FixedRange { msr: 0x268, start: 0xC_0000, sub_size: 0x1000 },
    FixedRange { msr: 0x269, start: 0xC_8000, sub_size: 0x1000 },
    FixedRange { msr: 0x26A, start: 0xD_0000, sub_size: 0x1000 },
    FixedRange { msr: 0x26B, start: 0xD_8000, sub_size: 0x1000 },
    FixedRange { msr: 0x26C, start: 0xE_0000, sub_size: 0x1000 },
    FixedRange { msr: 0x26D, start: 0xE_8000, sub_size: 0x1000 },
    FixedRange { msr: 0x26E, start: 0xF_0000, sub_size: 0x1000 },
    FixedRange { msr: 0x26F, start: 0xF_8000, sub_size: 0x1000 },
];

const FIXED_RANGE_HIGH: u64 = 0x10_0000;

/// Whether memory-type reporting is available at all.
pub fn supported<M: Msrs>(hw: &M) -> bool {
    hw.rdmsr(IA32_MTRR_DEF_TYPE) & DEF_TYPE_ENABLE != 0
}

/// A loaded copy of the MTRR configuration.
pub struct MtrrRanges {
    default_type: MemoryType,
    fixed_enabled: bool,
    fixed: [u64; FIXED_RANGES.len()],
    variable: Vec<(u64, u64)>,
}

impl MtrrRanges {
    /// Read the MTRR MSR set once.
    pub fn load<M: Msrs>(hw: &M) -> Self {
        let cap = hw.rdmsr(IA32_MTRRCAP);
        let def = hw.rdmsr(IA32_MTRR_DEF_TYPE);

        let fixed_enabled =
            cap & MTRRCAP_FIXED_SUPPORT != 0 && def & DEF_TYPE_FIXED_ENABLE != 0;
        let mut fixed = [0u64; FIXED_RANGES.len()];
        if fixed_enabled {
            for (slot, range) in fixed.iter_mut().zip(FIXED_RANGES.iter()) {
                *slot = hw.rdmsr(range.msr);
            }
        }

        let variable_count = (cap & 0xff) as u32;
        let mut variable = Vec::new();
        for i in 0..variable_count {
            let base = hw.rdmsr(IA32_MTRR_PHYSBASE0 + 2 * i);
            let mask = hw.rdmsr(IA32_MTRR_PHYSMASK0 + 2 * i);
            if mask & PHYSMASK_VALID != 0 {
                variable.push((base, mask));
            }
        }

        Self {
            default_type: MemoryType::from_bits(def & 0x7).unwrap_or(MemoryType::Uncacheable),
            fixed_enabled,
            fixed,
            variable,
        }
    }

    fn merge(record: &mut Option<MemoryType>, candidate: MemoryType) -> bool {
        // The numerically smaller type is the more restrictive one;
        // uncacheable ends the search outright.
        if record.map_or(true, |cur| candidate < cur) {
            *record = Some(candidate);
        }
        *record == Some(MemoryType::Uncacheable)
    }
}

impl MemTypeOracle for MtrrRanges {
    fn memory_type(&self, start: Pa, len: usize) -> MemoryType {
        let search_base = unsafe { start.into_usize() } as u64;
        let search_limit = search_base + (len as u64 - 1);
        let mut record: Option<MemoryType> = None;

        if self.fixed_enabled && search_base < FIXED_RANGE_HIGH {
            for (mask, range) in self.fixed.iter().zip(FIXED_RANGES.iter()) {
                let range_end = range.start + range.sub_size * FIXED_SUB_RANGE_COUNT as u64 - 1;
                if search_base > range_end || search_limit < range.start {
                    continue;
                }
                for sub in 0..FIXED_SUB_RANGE_COUNT {
                    let sub_base = range.start + range.sub_size * sub as u64;
                    let sub_limit = sub_base + range.sub_size - 1;
                    if search_base <= sub_limit && search_limit >= sub_base {
                        let bits = (mask >> (8 * sub)) & 0xff;
                        if let Some(ty) = MemoryType::from_bits(bits) {
                            if Self::merge(&mut record, ty) {
                                return MemoryType::Uncacheable;
                            }
                        }
                    }
                }
            }
        }

        for &(base, mask) in self.variable.iter() {
            let range_base = base & PHYS_ADDR_MASK;
            let range_mask = mask & PHYS_ADDR_MASK;
            if range_mask == 0 {
                continue;
            }
            // The range length is the value of the lowest set mask bit.
            let range_limit = range_base + ((1u64 << range_mask.trailing_zeros()) - 1);
            if search_base <= range_limit && search_limit >= range_base {
                if let Some(ty) = MemoryType::from_bits(base & 0x7) {
                    if Self::merge(&mut record, ty) {
                        return MemoryType::Uncacheable;
                    }
                }
            }
        }

        record.unwrap_or(self.default_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MsrFile(BTreeMap<u32, u64>);
    impl Msrs for MsrFile {
        fn rdmsr(&self, msr: u32) -> u64 {
            *self.0.get(&msr).unwrap_or(&0)
        }
    }

    fn hw() -> MsrFile {
        let mut m = BTreeMap::new();
        // 8 variable registers, fixed support.
        m.insert(IA32_MTRRCAP, 0x08 | MTRRCAP_FIXED_SUPPORT);
        // Enabled, fixed enabled, default write-back.
        m.insert(IA32_MTRR_DEF_TYPE, DEF_TYPE_ENABLE | DEF_TYPE_FIXED_ENABLE | 6);
        // First 512KB write-back.
        m.insert(0x250, 0x0606_0606_0606_0606);
        // 0xA0000..0xC0000 write-combining.
        m.insert(0x259, 0x0101_0101_0101_0101);
        // Variable range: 2MB at 0x40_0000, uncacheable.
        m.insert(IA32_MTRR_PHYSBASE0, 0x0040_0000);
        m.insert(IA32_MTRR_PHYSMASK0, (!0x001f_ffffu64 & PHYS_ADDR_MASK) | PHYSMASK_VALID);
        MsrFile(m)
    }

    #[test]
    fn default_type_for_unclaimed_ranges() {
        let ranges = MtrrRanges::load(&hw());
        let ty = ranges.memory_type(Pa::new(0x1000_0000).unwrap(), 0x20_0000);
        assert_eq!(ty, MemoryType::WriteBack);
    }

    #[test]
    fn variable_range_wins_over_default() {
        let ranges = MtrrRanges::load(&hw());
        let ty = ranges.memory_type(Pa::new(0x40_0000).unwrap(), 0x20_0000);
        assert_eq!(ty, MemoryType::Uncacheable);
        // A range straddling the UC region is also UC.
        let ty = ranges.memory_type(Pa::new(0x3f_0000).unwrap(), 0x20_0000);
        assert_eq!(ty, MemoryType::Uncacheable);
    }

    #[test]
    fn fixed_ranges_resolve_below_one_megabyte() {
        let ranges = MtrrRanges::load(&hw());
        assert_eq!(
            ranges.memory_type(Pa::new(0x1000).unwrap(), 0x1000),
            MemoryType::WriteBack
        );
        assert_eq!(
            ranges.memory_type(Pa::new(0xA0000).unwrap(), 0x4000),
            MemoryType::WriteCombining
        );
    }

    #[test]
    fn reporting_support_follows_enable_bit() {
        assert!(supported(&hw()));
        let mut m = BTreeMap::new();
        m.insert(IA32_MTRR_DEF_TYPE, 6);
        assert!(!supported(&MsrFile(m)));
    }
}
