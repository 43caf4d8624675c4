//! Heuristic classification of pointer-sized values inside a structure.
//!
//! The scanner has no type information. A value is a candidate when it falls
//! inside the platform's kernel pointer range, which coincidental bit patterns
//! do as well. Callers should present the results as an estimate with an
//! unknown false-positive rate.

use crate::error::{Error, Result};
use crate::memory::{rel_addr, MemoryReader};
use crate::platform::CanonicalRange;

use memflow::prelude::v1::*;

use log::*;

/// Byte window `[start, end)` relative to a base address, sampled every
/// `stride` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanWindow {
    pub start: isize,
    pub end: isize,
    pub stride: usize,
}

impl ScanWindow {
    pub fn new(start: isize, end: isize, stride: usize) -> Result<Self> {
        if stride == 0 {
            return Err(Error::InvalidScanWindow("stride must be non-zero"));
        }
        if start >= end {
            return Err(Error::InvalidScanWindow("start must be below end"));
        }
        Ok(Self { start, end, stride })
    }

    pub fn offsets(&self) -> impl Iterator<Item = isize> {
        (self.start..self.end).step_by(self.stride)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CandidatePointer {
    pub offset: isize,
    pub value: Address,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Every candidate found, including those not kept as examples.
    pub total: usize,
    /// The first candidates, in ascending offset order.
    pub examples: Vec<CandidatePointer>,
    /// Offsets whose read failed.
    pub unreadable: usize,
}

/// Scans `window` around `base` for values inside `range`.
///
/// Failed reads are skipped. Only the first `max_examples` candidates are
/// kept, while `total` counts all of them.
pub fn scan_pointers(
    mem: &mut impl MemoryReader,
    base: Address,
    window: &ScanWindow,
    range: &CanonicalRange,
    max_examples: usize,
) -> Result<ScanSummary> {
    if window.stride == 0 || window.start >= window.end {
        return Err(Error::InvalidScanWindow("empty window"));
    }

    let mut summary = ScanSummary::default();

    for offset in window.offsets() {
        let value = match mem.read_pointer(rel_addr(base, offset)) {
            Ok(value) => value,
            Err(_) => {
                summary.unreadable += 1;
                continue;
            }
        };

        if range.contains(value) {
            summary.total += 1;
            if summary.examples.len() < max_examples {
                summary.examples.push(CandidatePointer { offset, value });
            }
        }
    }

    trace!(
        "scan at {:x}: {} candidates, {} unreadable",
        base,
        summary.total,
        summary.unreadable
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fake::FakeMemory;
    use crate::memory::PointerWidth;
    use crate::platform::Platform;

    const BASE: u64 = 0x8000;

    fn window() -> ScanWindow {
        ScanWindow::new(0, 0x40, 8).unwrap()
    }

    fn zeroed() -> FakeMemory {
        let mut mem = FakeMemory::new(PointerWidth::U64);
        mem.fill(BASE, 0x40, 0);
        mem
    }

    #[test]
    fn all_zero_window_has_no_candidates() {
        let mut mem = zeroed();
        let range = Platform::WinX64.canonical_range();

        let summary =
            scan_pointers(&mut mem, Address::from(BASE), &window(), &range, 3).unwrap();

        assert_eq!(summary.total, 0);
        assert!(summary.examples.is_empty());
    }

    #[test]
    fn single_candidate_reports_its_offset() {
        let mut mem = zeroed();
        mem.write_u64(BASE + 0x18, 0xfffffa80_0c0ffee0);
        let range = Platform::WinX64.canonical_range();

        let summary =
            scan_pointers(&mut mem, Address::from(BASE), &window(), &range, 1).unwrap();

        assert_eq!(summary.total, 1);
        assert_eq!(
            summary.examples,
            vec![CandidatePointer {
                offset: 0x18,
                value: Address::from(0xfffffa80_0c0ffee0u64),
            }]
        );
    }

    #[test]
    fn total_counts_beyond_example_limit() {
        let mut mem = zeroed();
        for i in 0..5u64 {
            mem.write_u64(BASE + i * 8, 0xfffff800_00001000 + i);
        }
        let range = Platform::WinX64.canonical_range();

        let summary =
            scan_pointers(&mut mem, Address::from(BASE), &window(), &range, 3).unwrap();

        assert_eq!(summary.total, 5);
        assert_eq!(summary.examples.len(), 3);
        assert_eq!(
            summary.examples.iter().map(|c| c.offset).collect::<Vec<_>>(),
            vec![0, 8, 16]
        );
    }

    #[test]
    fn unreadable_offsets_are_skipped() {
        let mut mem = zeroed();
        mem.write_u64(BASE + 0x30, 0xfffff800_00002000);
        mem.break_at(BASE + 0x8);
        mem.break_at(BASE + 0x10);
        let range = Platform::WinX64.canonical_range();

        let summary =
            scan_pointers(&mut mem, Address::from(BASE), &window(), &range, 3).unwrap();

        assert_eq!(summary.unreadable, 2);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.examples[0].offset, 0x30);
    }

    #[test]
    fn negative_offsets_are_relative_to_base() {
        let mut mem = FakeMemory::new(PointerWidth::U32);
        mem.fill(BASE - 0x10, 0x10, 0);
        mem.write_u32(BASE - 0x8, 0x8123_4567);
        let window = ScanWindow::new(-0x10, 0, 4).unwrap();

        let summary = scan_pointers(
            &mut mem,
            Address::from(BASE),
            &window,
            &Platform::WinX86.canonical_range(),
            3,
        )
        .unwrap();

        assert_eq!(summary.total, 1);
        assert_eq!(summary.examples[0].offset, -0x8);
    }

    #[test]
    fn rejects_degenerate_windows() {
        assert!(ScanWindow::new(0, 0x10, 0).is_err());
        assert!(ScanWindow::new(0x10, 0x10, 8).is_err());

        let mut mem = zeroed();
        let bad = ScanWindow {
            start: 0,
            end: 0x40,
            stride: 0,
        };
        assert!(scan_pointers(
            &mut mem,
            Address::from(BASE),
            &bad,
            &Platform::WinX64.canonical_range(),
            3
        )
        .is_err());
    }
}
