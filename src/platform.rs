use crate::memory::PointerWidth;

use memflow::architecture::x86::{x32, x64, X86VirtualTranslate};
use memflow::prelude::v1::*;

use std::str::FromStr;

/// Closed-open interval of addresses that look like kernel pointers.
///
/// This is a plausibility filter, nothing more.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanonicalRange {
    pub start: u64,
    pub end: u64,
}

impl CanonicalRange {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, value: Address) -> bool {
        let value = value.to_umem() as u64;
        value >= self.start && value < self.end
    }
}

impl std::fmt::Display for CanonicalRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[0x{:x}, 0x{:x})", self.start, self.end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    WinX64,
    WinX86,
}

impl Platform {
    pub fn pointer_width(self) -> PointerWidth {
        match self {
            Platform::WinX64 => PointerWidth::U64,
            Platform::WinX86 => PointerWidth::U32,
        }
    }

    /// Kernel half of the address space.
    pub fn canonical_range(self) -> CanonicalRange {
        match self {
            Platform::WinX64 => CanonicalRange::new(0xfffff800_00000000, 0xffffffff_ffffffff),
            Platform::WinX86 => CanonicalRange::new(0x8000_0000, 0xffff_ffff),
        }
    }

    pub fn arch(self) -> ArchitectureObj {
        match self {
            Platform::WinX64 => x64::ARCH,
            Platform::WinX86 => x32::ARCH,
        }
    }

    pub fn translator(self, dtb: Address) -> X86VirtualTranslate {
        match self {
            Platform::WinX64 => x64::new_translator(dtb),
            Platform::WinX86 => x32::new_translator(dtb),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Platform::WinX64 => "win-x64",
            Platform::WinX86 => "win-x86",
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "win-x64" | "x64" => Ok(Platform::WinX64),
            "win-x86" | "x86" => Ok(Platform::WinX86),
            _ => Err(format!("unsupported platform `{}`", s)),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
