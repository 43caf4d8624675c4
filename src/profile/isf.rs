//! Volatility3 intermediate symbol format (ISF) files.
//!
//! Only the parts needed for offset resolution are parsed: struct field
//! offsets under `user_types` and symbol addresses under `symbols`. Files may
//! be plain JSON or xz-compressed, as Volatility ships them.

use crate::error::{Error, Result};
use crate::offsets::{Field, Offset, OffsetSource};

use serde::Deserialize;

use log::*;

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const PROCESS_STRUCT: &str = "_EPROCESS";

#[derive(Deserialize, Debug, Default)]
pub struct IsfSymbols {
    #[serde(default)]
    user_types: BTreeMap<String, UserType>,
    #[serde(default)]
    symbols: BTreeMap<String, Symbol>,
}

#[derive(Deserialize, Debug, Clone)]
struct UserType {
    kind: String,
    #[serde(default)]
    fields: BTreeMap<String, FieldDef>,
}

#[derive(Deserialize, Debug, Clone, Copy)]
struct FieldDef {
    offset: u64,
}

#[derive(Deserialize, Debug, Clone, Copy)]
struct Symbol {
    address: u64,
}

impl IsfSymbols {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("loading symbols from {}", path.display());
        Self::from_slice(&std::fs::read(path)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.starts_with(&XZ_MAGIC) {
            let mut decoder = xz2::read::XzDecoder::new(data);
            let mut json = Vec::new();
            decoder.read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(data)?)
        }
    }

    /// Field offsets of the process structure.
    ///
    /// `_EPROCESS` is preferred; otherwise the first struct whose name
    /// contains `EPROCESS` is used.
    pub fn process_type(&self) -> Result<StructOffsets> {
        let exact = self
            .user_types
            .get(PROCESS_STRUCT)
            .filter(|t| t.kind == "struct")
            .map(|t| (PROCESS_STRUCT, t));

        let (name, ty) = exact
            .or_else(|| {
                self.user_types
                    .iter()
                    .find(|(name, t)| name.contains("EPROCESS") && t.kind == "struct")
                    .map(|(name, t)| (name.as_str(), t))
            })
            .ok_or(Error::MissingStruct(PROCESS_STRUCT))?;

        debug!("using {} with {} fields", name, ty.fields.len());

        Ok(StructOffsets {
            fields: ty
                .fields
                .iter()
                .map(|(name, def)| (name.clone(), def.offset as usize))
                .collect(),
        })
    }

    /// Address of a kernel symbol, relative to the kernel base.
    pub fn symbol(&self, name: &str) -> Result<u64> {
        self.symbols
            .get(name)
            .map(|s| s.address)
            .ok_or_else(|| Error::MissingSymbol(name.to_string()))
    }
}

/// Field offsets of one struct from a symbol file.
#[derive(Clone, Debug, Default)]
pub struct StructOffsets {
    fields: BTreeMap<String, usize>,
}

impl OffsetSource for StructOffsets {
    fn resolve(&self, field: Field) -> Offset {
        self.fields.get(field.struct_field()).copied().into()
    }
}
