/*!
Offset-driven process enumeration over guest kernel memory.

The crate walks the kernel's circular process list through a memflow view of
the guest, using only byte offsets of a few structure fields, and applies a
pointer-range heuristic to find thread-related pointers where no type
information is available. Reads can fail at any point and the guest keeps
running while it is inspected, so every walk reports why it stopped.
*/

pub mod enumerate;
pub mod error;
pub mod memory;
pub mod offsets;
pub mod platform;
pub mod process;
pub mod profile;
pub mod scan;
pub mod session;
pub mod walk;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::enumerate::{
        Enumerator, ProbePhase, RecordFilter, Report, Select, ThreadPhase,
    };
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        BoundedString, GuestView, MemoryReader, NameLimit, Overflow, PointerWidth,
    };
    pub use crate::offsets::{Field, Offset, OffsetSource, OffsetTable};
    pub use crate::platform::{CanonicalRange, Platform};
    pub use crate::process::{walk_processes, ProcessRecord};
    pub use crate::profile::{IsfSymbols, OsVersion, Profile};
    pub use crate::scan::{scan_pointers, CandidatePointer, ScanSummary, ScanWindow};
    pub use crate::session::{attach, Session, SessionConfig};
    pub use crate::walk::{HeadKind, ListWalker, Termination, WalkConfig, WalkOutcome};
}
