use crate::error::Result;
use crate::memory::{field_addr, MemoryReader, NameLimit};
use crate::offsets::{Field, OffsetTable};
use crate::platform::{CanonicalRange, Platform};
use crate::process::{walk_processes, ProcessRecord};
use crate::scan::{scan_pointers, ScanSummary, ScanWindow};
use crate::walk::{HeadKind, ListWalker, Termination, WalkConfig, WalkOutcome};

use memflow::prelude::v1::*;

use log::*;

/// Decides which records a phase looks at.
pub trait Select {
    fn select(&self, record: &ProcessRecord) -> bool;
}

impl<F: Fn(&ProcessRecord) -> bool> Select for F {
    fn select(&self, record: &ProcessRecord) -> bool {
        self(record)
    }
}

/// Name substring and pid threshold selection.
#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    /// Any of these must appear in the name. Empty matches every name.
    pub name_contains: Vec<String>,
    /// Pids must be strictly greater than this.
    pub min_pid: Option<u32>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name_contains(mut self, pattern: &str) -> Self {
        self.name_contains.push(pattern.to_string());
        self
    }

    pub fn pid_above(mut self, pid: u32) -> Self {
        self.min_pid = Some(pid);
        self
    }
}

impl Select for RecordFilter {
    fn select(&self, record: &ProcessRecord) -> bool {
        let pid_ok = self.min_pid.map(|min| record.pid > min).unwrap_or(true);
        let name_ok = self.name_contains.is_empty()
            || self
                .name_contains
                .iter()
                .any(|p| record.name.as_str().contains(p.as_str()));
        pid_ok && name_ok
    }
}

/// Reads a word at a fixed offset from each selected record, and its Peb
/// pointer when that offset is known.
pub struct ProbePhase {
    pub select: Box<dyn Select>,
    pub limit: Option<usize>,
    pub probe_offset: usize,
}

impl Default for ProbePhase {
    fn default() -> Self {
        Self {
            select: Box::new(
                RecordFilter::new()
                    .name_contains(".exe")
                    .name_contains("explorer")
                    .pid_above(100),
            ),
            limit: Some(10),
            probe_offset: 0x100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub record: ProcessRecord,
    pub word: Option<u32>,
    pub peb: Option<Address>,
}

/// Looks for thread-related pointers in each selected record.
pub struct ThreadPhase {
    pub select: Box<dyn Select>,
    pub limit: Option<usize>,
    pub window: ScanWindow,
    pub max_examples: usize,
}

impl ThreadPhase {
    /// Default selection with a window laid out for `platform`.
    ///
    /// The stride is the platform's pointer width, so every pointer slot in
    /// the window is sampled. The x86 window ends past `ThreadListHead`.
    pub fn for_platform(platform: Platform) -> Self {
        let (start, end) = match platform {
            Platform::WinX64 => (0x150, 0x200),
            Platform::WinX86 => (0x150, 0x1c0),
        };

        Self {
            select: Box::new(RecordFilter::new().pid_above(4)),
            limit: Some(10),
            window: ScanWindow {
                start,
                end,
                stride: platform.pointer_width().bytes(),
            },
            max_examples: 3,
        }
    }
}

impl Default for ThreadPhase {
    fn default() -> Self {
        Self::for_platform(Platform::WinX64)
    }
}

#[derive(Clone, Debug)]
pub struct ThreadResult {
    pub record: ProcessRecord,
    /// Heuristic candidates. An estimate, not a thread count.
    pub candidates: ScanSummary,
    /// Entries of the record's own thread list, when its offset is known.
    pub thread_list: Option<ListCount>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListCount {
    pub entries: usize,
    pub termination: Termination,
}

/// Outcome of every phase of one pass.
///
/// Phases after the process walk are `None` when disabled or when the walk
/// itself failed.
#[derive(Debug)]
pub struct Report {
    pub processes: Result<WalkOutcome<ProcessRecord>>,
    pub probes: Option<Result<Vec<ProbeResult>>>,
    pub threads: Option<Result<Vec<ThreadResult>>>,
}

impl Report {
    /// No phase failed. Partial walks still count as success, their
    /// termination tells how far they got.
    pub fn is_success(&self) -> bool {
        self.processes.is_ok()
            && !matches!(self.probes, Some(Err(_)))
            && !matches!(self.threads, Some(Err(_)))
    }
}

/// One enumeration pass: a single process walk feeding optional phases.
pub struct Enumerator {
    pub head: Address,
    pub walk: WalkConfig,
    pub name_limit: NameLimit,
    pub offsets: OffsetTable,
    pub canonical: CanonicalRange,
    pub probe: Option<ProbePhase>,
    pub threads: Option<ThreadPhase>,
}

impl Enumerator {
    pub fn new(head: Address, offsets: OffsetTable, canonical: CanonicalRange) -> Self {
        Self {
            head,
            walk: WalkConfig::default(),
            name_limit: NameLimit::default(),
            offsets,
            canonical,
            probe: None,
            threads: None,
        }
    }

    pub fn run<M: MemoryReader>(&self, mem: &mut M) -> Report {
        let processes = walk_processes(mem, self.head, &self.offsets, self.walk, self.name_limit);

        let (probes, threads) = match &processes {
            Ok(outcome) => (
                self.probe
                    .as_ref()
                    .map(|phase| self.run_probes(mem, phase, &outcome.records)),
                self.threads
                    .as_ref()
                    .map(|phase| self.run_threads(mem, phase, &outcome.records)),
            ),
            Err(err) => {
                error!("process enumeration failed: {}", err);
                (None, None)
            }
        };

        Report {
            processes,
            probes,
            threads,
        }
    }

    fn run_probes<M: MemoryReader>(
        &self,
        mem: &mut M,
        phase: &ProbePhase,
        records: &[ProcessRecord],
    ) -> Result<Vec<ProbeResult>> {
        let peb_offset = self.offsets.get(Field::Peb).known();

        let results = selected(records, phase.select.as_ref(), phase.limit)
            .map(|record| {
                let word = mem
                    .read_u32(field_addr(record.base, phase.probe_offset))
                    .ok();
                let peb = peb_offset
                    .and_then(|off| mem.read_pointer(field_addr(record.base, off)).ok());

                ProbeResult {
                    record: record.clone(),
                    word,
                    peb,
                }
            })
            .collect::<Vec<_>>();

        debug!("probed {} records", results.len());
        Ok(results)
    }

    fn run_threads<M: MemoryReader>(
        &self,
        mem: &mut M,
        phase: &ThreadPhase,
        records: &[ProcessRecord],
    ) -> Result<Vec<ThreadResult>> {
        let window = ScanWindow::new(phase.window.start, phase.window.end, phase.window.stride)?;
        let width = mem.pointer_width().bytes();
        if window.stride % width != 0 {
            warn!(
                "scan stride {} does not match {}-byte pointers, slots will be missed",
                window.stride, width
            );
        }
        let list_offset = self.offsets.get(Field::ThreadListHead).known();

        let mut results = vec![];

        for record in selected(records, phase.select.as_ref(), phase.limit) {
            let candidates = scan_pointers(
                mem,
                record.base,
                &window,
                &self.canonical,
                phase.max_examples,
            )?;

            let thread_list =
                list_offset.map(|off| self.count_list(mem, field_addr(record.base, off)));

            results.push(ThreadResult {
                record: record.clone(),
                candidates,
                thread_list,
            });
        }

        Ok(results)
    }

    /// Counts entries of a list anchored at `anchor`, without extracting them.
    fn count_list<M: MemoryReader>(&self, mem: &mut M, anchor: Address) -> ListCount {
        let config = WalkConfig {
            head: HeadKind::Sentinel,
            ..self.walk
        };

        let outcome = ListWalker::new(mem, anchor, 0, config, |_: &mut M, entry| Ok(entry))
            .collect_outcome();

        ListCount {
            entries: outcome.records.len(),
            termination: outcome.termination,
        }
    }
}

fn selected<'a>(
    records: &'a [ProcessRecord],
    select: &'a dyn Select,
    limit: Option<usize>,
) -> impl Iterator<Item = &'a ProcessRecord> + 'a {
    records
        .iter()
        .filter(move |r| select.select(r))
        .take(limit.unwrap_or(usize::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::memory::fake::FakeMemory;
    use crate::memory::PointerWidth;
    use crate::process::tests::{base_of, link_of, offsets, process_list};

    const NAMES: [&str; 4] = ["System", "smss.exe", "explorer.exe", "svchost.exe"];

    fn enumerator(offsets: OffsetTable) -> Enumerator {
        Enumerator::new(
            Address::from(link_of(0)),
            offsets,
            Platform::WinX64.canonical_range(),
        )
    }

    fn setup() -> FakeMemory {
        let mut mem = FakeMemory::new(PointerWidth::U64);
        for i in 0..NAMES.len() as u64 {
            mem.fill(base_of(i) + 0x150, 0xb0, 0);
            mem.write_u32(base_of(i) + 0x100, 0xc0de_0000 + i as u32);
        }
        process_list(&mut mem, &NAMES);
        mem
    }

    #[test]
    fn filter_matches_names_and_pids() {
        let filter = RecordFilter::new().name_contains(".exe").pid_above(4);
        let record = |pid, name: &str| ProcessRecord {
            pid,
            name: crate::memory::BoundedString::from_bytes(name.as_bytes(), NameLimit::default())
                .unwrap(),
            base: Address::NULL,
        };

        assert!(filter.select(&record(8, "smss.exe")));
        assert!(!filter.select(&record(4, "smss.exe")));
        assert!(!filter.select(&record(8, "System")));
        assert!(RecordFilter::new().select(&record(0, "Idle")));
    }

    #[test]
    fn walk_only_when_phases_disabled() {
        let mut mem = setup();
        let report = enumerator(offsets()).run(&mut mem);

        assert!(report.is_success());
        assert_eq!(report.processes.unwrap().records.len(), 4);
        assert!(report.probes.is_none());
        assert!(report.threads.is_none());
    }

    #[test]
    fn probes_selected_records() {
        let mut mem = setup();
        let mut e = enumerator(offsets());
        e.probe = Some(ProbePhase {
            select: Box::new(|r: &ProcessRecord| r.name.as_str().ends_with(".exe")),
            limit: Some(2),
            probe_offset: 0x100,
        });

        let report = e.run(&mut mem);
        let probes = report.probes.unwrap().unwrap();

        assert_eq!(
            probes.iter().map(|p| p.record.pid).collect::<Vec<_>>(),
            vec![8, 12]
        );
        assert_eq!(probes[0].word, Some(0xc0de_0001));
        // no Peb offset in the table
        assert_eq!(probes[0].peb, None);
    }

    #[test]
    fn probe_reads_peb_when_offset_known() {
        let mut mem = setup();
        mem.write_u64(base_of(2) + 0x338, 0x7fffffd_f000);
        let mut e = enumerator(offsets().with(Field::Peb, 0x338));
        e.probe = Some(ProbePhase::default());

        let report = e.run(&mut mem);
        let probes = report.probes.unwrap().unwrap();

        // default selection: pid > 100, none in this list
        assert!(probes.is_empty());

        let mut e = enumerator(offsets().with(Field::Peb, 0x338));
        e.probe = Some(ProbePhase {
            select: Box::new(RecordFilter::new().name_contains("explorer")),
            ..ProbePhase::default()
        });
        let probes = e.run(&mut mem).probes.unwrap().unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].peb, Some(Address::from(0x7fffffd_f000u64)));
    }

    #[test]
    fn thread_phase_scans_selected_records() {
        let mut mem = setup();
        mem.write_u64(base_of(1) + 0x158, 0xfffffa80_00001000);
        mem.write_u64(base_of(1) + 0x1f8, 0xfffffa80_00002000);

        let mut e = enumerator(offsets());
        e.threads = Some(ThreadPhase::default());

        let report = e.run(&mut mem);
        assert!(report.is_success());
        let threads = report.threads.unwrap().unwrap();

        // System (pid 4) is excluded by the default selection
        assert_eq!(
            threads.iter().map(|t| t.record.pid).collect::<Vec<_>>(),
            vec![8, 12, 16]
        );
        assert_eq!(threads[0].candidates.total, 2);
        assert_eq!(threads[0].candidates.examples[0].offset, 0x158);
        assert_eq!(threads[1].candidates.total, 0);
        assert!(threads[0].thread_list.is_none());
    }

    #[test]
    fn thread_phase_samples_every_x86_pointer_slot() {
        let mut mem = FakeMemory::new(PointerWidth::U32);
        for i in 0..NAMES.len() as u64 {
            mem.fill(base_of(i) + 0x150, 0x70, 0);
        }
        process_list(&mut mem, &NAMES);
        mem.write_u32(base_of(1) + 0x154, 0x8a00_1000);
        mem.write_u32(base_of(1) + 0x15c, 0x8a00_2000);

        let mut e = Enumerator::new(
            Address::from(link_of(0)),
            offsets(),
            Platform::WinX86.canonical_range(),
        );
        e.threads = Some(ThreadPhase::for_platform(Platform::WinX86));

        let threads = e.run(&mut mem).threads.unwrap().unwrap();
        assert_eq!(threads[0].record.pid, 8);
        assert_eq!(threads[0].candidates.total, 2);
        assert_eq!(
            threads[0]
                .candidates
                .examples
                .iter()
                .map(|c| c.offset)
                .collect::<Vec<_>>(),
            vec![0x154, 0x15c]
        );

        // an 8-byte stride only sees the even slots
        e.threads = Some(ThreadPhase::default());
        let threads = e.run(&mut mem).threads.unwrap().unwrap();
        assert_eq!(threads[0].candidates.total, 0);
    }

    #[test]
    fn platform_windows_use_pointer_sized_strides() {
        assert_eq!(ThreadPhase::for_platform(Platform::WinX64).window.stride, 8);
        assert_eq!(ThreadPhase::for_platform(Platform::WinX86).window.stride, 4);
        assert_eq!(ThreadPhase::default().window.start, 0x150);
    }

    #[test]
    fn thread_phase_counts_thread_list() {
        let mut mem = setup();
        let anchor = base_of(1) + 0x308;
        let entries = [0x90_0000u64, 0x90_1000, 0x90_2000];
        mem.write_u64(anchor, entries[0]);
        mem.write_u64(entries[0], entries[1]);
        mem.write_u64(entries[1], entries[2]);
        mem.write_u64(entries[2], anchor);

        let mut e = enumerator(offsets().with(Field::ThreadListHead, 0x308));
        e.threads = Some(ThreadPhase {
            select: Box::new(RecordFilter::new().name_contains("smss")),
            ..ThreadPhase::default()
        });

        let threads = e.run(&mut mem).threads.unwrap().unwrap();
        assert_eq!(
            threads[0].thread_list,
            Some(ListCount {
                entries: 3,
                termination: Termination::CompletedCycle
            })
        );
    }

    #[test]
    fn invalid_window_fails_the_phase_only() {
        let mut mem = setup();
        let mut e = enumerator(offsets());
        e.threads = Some(ThreadPhase {
            window: ScanWindow {
                start: 0x200,
                end: 0x150,
                stride: 8,
            },
            ..ThreadPhase::default()
        });

        let report = e.run(&mut mem);
        assert!(report.processes.is_ok());
        assert!(matches!(
            report.threads,
            Some(Err(Error::InvalidScanWindow(_)))
        ));
        assert!(!report.is_success());
    }

    #[test]
    fn missing_offsets_skip_dependent_phases() {
        let mut mem = setup();
        let mut e = enumerator(OffsetTable::new().with(Field::Link, 0x188));
        e.probe = Some(ProbePhase::default());
        e.threads = Some(ThreadPhase::default());

        let report = e.run(&mut mem);

        assert!(matches!(
            report.processes,
            Err(Error::OffsetUnavailable(_))
        ));
        assert!(report.probes.is_none());
        assert!(report.threads.is_none());
        assert!(!report.is_success());
        assert_eq!(mem.reads, 0);
    }
}
