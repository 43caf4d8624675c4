use crate::error::{Error, Result};
use crate::offsets::{Field, Offset, OffsetSource, OffsetTable};
use crate::platform::Platform;

use std::ops::RangeInclusive;
use std::str::FromStr;

pub mod isf;

pub use isf::IsfSymbols;

/// Windows kernel version, as reported by `major.minor.build`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
}

impl OsVersion {
    pub const fn new(major: u32, minor: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            build,
        }
    }
}

impl std::fmt::Display for OsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.build)
    }
}

impl FromStr for OsVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts = s
            .split('.')
            .map(str::parse::<u32>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid version `{}`: {}", s, e))?;

        match parts[..] {
            [major, minor, build] => Ok(Self::new(major, minor, build)),
            _ => Err(format!("expected major.minor.build, got `{}`", s)),
        }
    }
}

/// Field offsets of one OS build, plus the platform they belong to.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    /// Builds sharing this layout, if known.
    pub builds: Option<RangeInclusive<OsVersion>>,
    pub platform: Platform,
    pub offsets: OffsetTable,
}

impl Profile {
    /// Profiles compiled into the crate.
    pub fn builtin() -> Vec<Profile> {
        vec![
            Profile {
                name: "win7-sp1-x64".into(),
                builds: Some(OsVersion::new(6, 1, 7601)..=OsVersion::new(6, 1, 7601)),
                platform: Platform::WinX64,
                offsets: OffsetTable::new()
                    .with(Field::DirectoryTableBase, 0x28)
                    .with(Field::Pid, 0x180)
                    .with(Field::Link, 0x188)
                    .with(Field::Name, 0x2e0)
                    .with(Field::ThreadListHead, 0x308)
                    .with(Field::Peb, 0x338),
            },
            Profile {
                name: "win7-sp1-x86".into(),
                builds: Some(OsVersion::new(6, 1, 7601)..=OsVersion::new(6, 1, 7601)),
                platform: Platform::WinX86,
                offsets: OffsetTable::new()
                    .with(Field::DirectoryTableBase, 0x18)
                    .with(Field::Pid, 0xb4)
                    .with(Field::Link, 0xb8)
                    .with(Field::Name, 0x16c)
                    .with(Field::ThreadListHead, 0x188)
                    .with(Field::Peb, 0x1a8),
            },
            Profile {
                // 2004 through 22H2 share the _EPROCESS layout
                name: "win10-2004-x64".into(),
                builds: Some(OsVersion::new(10, 0, 19041)..=OsVersion::new(10, 0, 19045)),
                platform: Platform::WinX64,
                offsets: OffsetTable::new()
                    .with(Field::DirectoryTableBase, 0x28)
                    .with(Field::Pid, 0x440)
                    .with(Field::Link, 0x448)
                    .with(Field::Peb, 0x550)
                    .with(Field::Name, 0x5a8)
                    .with(Field::ThreadListHead, 0x5e0),
            },
        ]
    }

    pub fn by_name(name: &str) -> Result<Profile> {
        Self::builtin()
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::UnknownProfile(name.to_string()))
    }

    pub fn by_version(version: OsVersion, platform: Platform) -> Result<Profile> {
        Self::builtin()
            .into_iter()
            .find(|p| {
                p.platform == platform
                    && p.builds
                        .as_ref()
                        .map(|b| b.contains(&version))
                        .unwrap_or(false)
            })
            .ok_or_else(|| Error::UnknownProfile(format!("{} ({})", version, platform)))
    }

    /// Builds a profile from a Volatility3 symbol file.
    pub fn from_isf(name: &str, symbols: &IsfSymbols, platform: Platform) -> Result<Profile> {
        Ok(Profile {
            name: name.to_string(),
            builds: None,
            platform,
            offsets: OffsetTable::resolve_from(&symbols.process_type()?),
        })
    }
}

impl OffsetSource for Profile {
    fn resolve(&self, field: Field) -> Offset {
        self.offsets.get(field)
    }
}

/// Renders offsets as a libvmi configuration block for `domain`.
pub fn libvmi_config(domain: &str, offsets: &OffsetTable) -> String {
    let mut out = format!("{} {{\n    ostype = \"Windows\";\n", domain);
    for field in Field::ALL.iter() {
        if let Offset::Known(v) = offsets.get(*field) {
            out += &format!("    {} = 0x{:x};\n", field.config_key(), v);
        }
    }
    out += "}\n";
    out
}
