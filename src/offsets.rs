use crate::error::{Error, Result};

use std::collections::BTreeMap;

/// Process structure fields the walker and its extractors know about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    /// `ActiveProcessLinks`, the forward link of the process list.
    Link,
    Pid,
    Name,
    Peb,
    ThreadListHead,
    DirectoryTableBase,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Link,
        Field::Pid,
        Field::Name,
        Field::Peb,
        Field::ThreadListHead,
        Field::DirectoryTableBase,
    ];

    /// Name of the field inside `_EPROCESS`.
    pub fn struct_field(self) -> &'static str {
        match self {
            Field::Link => "ActiveProcessLinks",
            Field::Pid => "UniqueProcessId",
            Field::Name => "ImageFileName",
            Field::Peb => "Peb",
            Field::ThreadListHead => "ThreadListHead",
            Field::DirectoryTableBase => "DirectoryTableBase",
        }
    }

    /// libvmi configuration key for the field.
    pub fn config_key(self) -> &'static str {
        match self {
            Field::Link => "win_tasks",
            Field::Pid => "win_pid",
            Field::Name => "win_pname",
            Field::Peb => "win_peb",
            Field::ThreadListHead => "win_threads",
            Field::DirectoryTableBase => "win_pdbase",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.struct_field())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offset {
    Known(usize),
    Unknown,
}

impl Offset {
    pub fn known(self) -> Option<usize> {
        match self {
            Offset::Known(v) => Some(v),
            Offset::Unknown => None,
        }
    }
}

impl From<Option<usize>> for Offset {
    fn from(v: Option<usize>) -> Self {
        v.map(Offset::Known).unwrap_or(Offset::Unknown)
    }
}

/// Anything that maps a field to a byte offset for one OS build.
///
/// Callers do not distinguish why an offset is unknown.
pub trait OffsetSource {
    fn resolve(&self, field: Field) -> Offset;
}

/// Offsets resolved once at the start of an enumeration pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetTable {
    offsets: BTreeMap<Field, usize>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve_from(source: &impl OffsetSource) -> Self {
        let offsets = Field::ALL
            .iter()
            .filter_map(|&f| source.resolve(f).known().map(|v| (f, v)))
            .collect();
        Self { offsets }
    }

    pub fn with(mut self, field: Field, offset: usize) -> Self {
        self.offsets.insert(field, offset);
        self
    }

    pub fn get(&self, field: Field) -> Offset {
        self.offsets.get(&field).copied().into()
    }

    pub fn known(&self) -> impl Iterator<Item = (Field, usize)> + '_ {
        self.offsets.iter().map(|(&f, &v)| (f, v))
    }

    /// Checks that every field in `fields` is known.
    ///
    /// All missing fields are listed in the error, not just the first.
    pub fn require(&self, fields: &[Field]) -> Result<ResolvedOffsets> {
        let missing = fields
            .iter()
            .copied()
            .filter(|f| !self.offsets.contains_key(f))
            .collect::<Vec<_>>();

        if !missing.is_empty() {
            return Err(Error::OffsetUnavailable(missing));
        }

        Ok(ResolvedOffsets {
            offsets: fields.iter().map(|&f| (f, self.offsets[&f])).collect(),
        })
    }
}

impl OffsetSource for OffsetTable {
    fn resolve(&self, field: Field) -> Offset {
        self.get(field)
    }
}

/// Subset of an [`OffsetTable`] that is known to be complete.
#[derive(Clone, Debug)]
pub struct ResolvedOffsets {
    offsets: BTreeMap<Field, usize>,
}

impl ResolvedOffsets {
    /// Offset of a field that was part of the `require` call.
    ///
    /// # Panics
    ///
    /// If `field` was not required when this set was built.
    pub fn get(&self, field: Field) -> usize {
        self.offsets[&field]
    }

    pub fn try_get(&self, field: Field) -> Option<usize> {
        self.offsets.get(&field).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_a_known_offset() {
        let table = OffsetTable::new().with(Field::DirectoryTableBase, 0);
        assert_eq!(table.get(Field::DirectoryTableBase), Offset::Known(0));
        assert_eq!(table.get(Field::Peb), Offset::Unknown);
    }

    #[test]
    fn require_lists_every_missing_field() {
        let table = OffsetTable::new().with(Field::Pid, 0x180);

        match table.require(&[Field::Link, Field::Pid, Field::Name]) {
            Err(Error::OffsetUnavailable(missing)) => {
                assert_eq!(missing, vec![Field::Link, Field::Name])
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn require_returns_resolved() {
        let table = OffsetTable::new()
            .with(Field::Link, 0x188)
            .with(Field::Pid, 0x180)
            .with(Field::Name, 0x2e0);

        let resolved = table.require(&[Field::Link, Field::Name]).unwrap();
        assert_eq!(resolved.get(Field::Link), 0x188);
        assert_eq!(resolved.get(Field::Name), 0x2e0);
        assert_eq!(resolved.try_get(Field::Pid), None);
    }

    #[test]
    fn resolves_from_source() {
        struct OnlyLink;

        impl OffsetSource for OnlyLink {
            fn resolve(&self, field: Field) -> Offset {
                match field {
                    Field::Link => Offset::Known(0x10),
                    _ => Offset::Unknown,
                }
            }
        }

        let table = OffsetTable::resolve_from(&OnlyLink);
        assert_eq!(table.known().collect::<Vec<_>>(), vec![(Field::Link, 0x10)]);
    }
}
