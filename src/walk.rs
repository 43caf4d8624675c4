/*!
Walking circular doubly-linked lists embedded in guest structures.

The list lives in memory of a running guest. Nothing stops the guest from
unlinking a node between two of our reads, so the walk is a best-effort view of
list order as observed, never an atomic snapshot. The outcome always says why
the walk stopped.
*/

use crate::memory::{container_of, MemoryReader};

use memflow::prelude::v1::*;

use log::*;

/// Why a walk stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The forward links led back to the head.
    CompletedCycle,
    /// A forward link could not be read. Records up to that node are kept.
    TraversalBroken,
    /// The walk took `max_iterations` steps without seeing the head again.
    IterationLimitExceeded,
}

impl Termination {
    pub fn is_complete(self) -> bool {
        self == Termination::CompletedCycle
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Termination::CompletedCycle => "completed cycle",
            Termination::TraversalBroken => "traversal broken (link read failed)",
            Termination::IterationLimitExceeded => "iteration limit exceeded",
        })
    }
}

/// What the head address points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeadKind {
    /// The head is the link field of a real node and is extracted like the others.
    Member,
    /// The head is a bare list anchor (e.g. `PsActiveProcessHead`). It is
    /// stepped over but never extracted.
    Sentinel,
}

#[derive(Clone, Copy, Debug)]
pub struct WalkConfig {
    pub max_iterations: usize,
    pub head: HeadKind,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            max_iterations: 0x10000,
            head: HeadKind::Member,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WalkOutcome<R> {
    pub records: Vec<R>,
    /// Nodes visited, including skipped ones and a sentinel head.
    pub steps: usize,
    /// Nodes whose fields could not be extracted.
    pub skipped: usize,
    pub termination: Termination,
}

/// Lazy walk over a circular list.
///
/// `extract` gets the reader and the base address of each node. An error
/// from it is a soft failure: the node is skipped and the walk goes on. A
/// failed forward link read ends the walk.
pub struct ListWalker<'a, M, F> {
    mem: &'a mut M,
    head: Address,
    link_offset: usize,
    config: WalkConfig,
    extract: F,
    cursor: Address,
    steps: usize,
    skipped: usize,
    termination: Option<Termination>,
}

impl<'a, M, F, R> ListWalker<'a, M, F>
where
    M: MemoryReader,
    F: FnMut(&mut M, Address) -> Result<R>,
{
    /// `head` is the address of a link field, not a structure base.
    pub fn new(
        mem: &'a mut M,
        head: Address,
        link_offset: usize,
        config: WalkConfig,
        extract: F,
    ) -> Self {
        Self {
            mem,
            head,
            link_offset,
            config,
            extract,
            cursor: head,
            steps: 0,
            skipped: 0,
            termination: None,
        }
    }

    /// Set once the walk has ended.
    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Visits the node at the cursor and advances. Returns the extracted
    /// record, if any.
    fn step(&mut self) -> Option<R> {
        let base = container_of(self.cursor, self.link_offset);

        let record = if self.config.head == HeadKind::Sentinel && self.cursor == self.head {
            None
        } else {
            match (self.extract)(&mut *self.mem, base) {
                Ok(record) => Some(record),
                Err(err) => {
                    debug!("skipping node at {:x}: {}", base, err);
                    self.skipped += 1;
                    None
                }
            }
        };

        self.steps += 1;

        match self.mem.read_pointer(self.cursor) {
            Ok(next) => {
                trace!("link {:x} -> {:x}", self.cursor, next);
                self.cursor = next;
                if next == self.head {
                    self.termination = Some(Termination::CompletedCycle);
                }
            }
            Err(err) => {
                warn!("forward link at {:x} unreadable: {}", self.cursor, err);
                self.termination = Some(Termination::TraversalBroken);
            }
        }

        record
    }

    pub fn collect_outcome(mut self) -> WalkOutcome<R> {
        let records = self.by_ref().collect();

        WalkOutcome {
            records,
            steps: self.steps,
            skipped: self.skipped,
            termination: self
                .termination
                .unwrap_or(Termination::IterationLimitExceeded),
        }
    }
}

impl<'a, M, F, R> Iterator for ListWalker<'a, M, F>
where
    M: MemoryReader,
    F: FnMut(&mut M, Address) -> Result<R>,
{
    type Item = R;

    fn next(&mut self) -> Option<Self::Item> {
        while self.termination.is_none() {
            if self.steps >= self.config.max_iterations {
                warn!(
                    "list at {:x} did not cycle within {} steps",
                    self.head, self.config.max_iterations
                );
                self.termination = Some(Termination::IterationLimitExceeded);
                break;
            }

            if let Some(record) = self.step() {
                return Some(record);
            }
        }

        None
    }
}
