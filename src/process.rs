use crate::error::Result;
use crate::memory::{field_addr, BoundedString, MemoryReader, NameLimit};
use crate::offsets::{Field, OffsetTable, ResolvedOffsets};
use crate::walk::{ListWalker, WalkConfig, WalkOutcome};

use memflow::prelude::v1::*;

use log::*;

/// Fields the process walk needs.
pub const PROCESS_FIELDS: [Field; 3] = [Field::Link, Field::Pid, Field::Name];

/// Minimal identity of one guest process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: BoundedString,
    /// Base of the process structure (`_EPROCESS`).
    pub base: Address,
}

/// Reads pid and name of the process structure at a base address.
#[derive(Clone, Copy, Debug)]
pub struct ProcessExtractor {
    pid_offset: usize,
    name_offset: usize,
    name_limit: NameLimit,
}

impl ProcessExtractor {
    pub fn new(offsets: &ResolvedOffsets, name_limit: NameLimit) -> Self {
        Self {
            pid_offset: offsets.get(Field::Pid),
            name_offset: offsets.get(Field::Name),
            name_limit,
        }
    }

    pub fn extract(
        &self,
        mem: &mut impl MemoryReader,
        base: Address,
    ) -> memflow::error::Result<ProcessRecord> {
        let pid = mem.read_u32(field_addr(base, self.pid_offset))?;
        let name = mem.read_bounded_string(field_addr(base, self.name_offset), self.name_limit)?;

        Ok(ProcessRecord { pid, name, base })
    }
}

/// Walks the process list that `head` belongs to.
///
/// Fails with `OffsetUnavailable` before touching guest memory when the link,
/// pid or name offset is unknown.
pub fn walk_processes<M: MemoryReader>(
    mem: &mut M,
    head: Address,
    offsets: &OffsetTable,
    config: WalkConfig,
    name_limit: NameLimit,
) -> Result<WalkOutcome<ProcessRecord>> {
    let resolved = offsets.require(&PROCESS_FIELDS)?;
    let extractor = ProcessExtractor::new(&resolved, name_limit);

    let outcome = ListWalker::new(
        mem,
        head,
        resolved.get(Field::Link),
        config,
        |mem: &mut M, base| extractor.extract(mem, base),
    )
    .collect_outcome();

    info!(
        "process walk from {:x}: {} records, {} skipped, {}",
        head,
        outcome.records.len(),
        outcome.skipped,
        outcome.termination
    );

    Ok(outcome)
}
