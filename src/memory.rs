use memflow::prelude::v1::*;

use dataview::Pod;

use log::trace;

/// Strings are read in chunks no larger than this, never crossing a page.
const STRING_CHUNK: usize = 64;
const PAGE_SIZE: usize = 0x1000;

/// `base + off` with wrap-around. Guest pointers are untrusted and may sit
/// anywhere in the address space.
pub fn field_addr(base: Address, off: usize) -> Address {
    Address::from(base.to_umem().wrapping_add(off as umem))
}

pub fn rel_addr(base: Address, off: isize) -> Address {
    Address::from(base.to_umem().wrapping_add(off as i64 as umem))
}

/// Base of the structure whose field at `off` lives at `field`.
pub fn container_of(field: Address, off: usize) -> Address {
    Address::from(field.to_umem().wrapping_sub(off as umem))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerWidth {
    U32,
    U64,
}

impl PointerWidth {
    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::U32 => 4,
            PointerWidth::U64 => 8,
        }
    }
}

/// What to do with a string that has no terminator within its limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overflow {
    Truncate,
    Reject,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NameLimit {
    pub max_len: usize,
    pub overflow: Overflow,
}

impl NameLimit {
    pub const fn new(max_len: usize, overflow: Overflow) -> Self {
        Self { max_len, overflow }
    }
}

impl Default for NameLimit {
    fn default() -> Self {
        Self::new(64, Overflow::Truncate)
    }
}

/// Owned string that never exceeds `max_len` bytes of guest data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundedString {
    value: String,
    max_len: usize,
}

impl BoundedString {
    /// Builds a string from raw guest bytes.
    ///
    /// The string ends at the first NUL. Without one inside `limit.max_len`
    /// bytes the overflow policy decides: keep the first `max_len` bytes, or
    /// give up with `None`.
    pub fn from_bytes(bytes: &[u8], limit: NameLimit) -> Option<Self> {
        let window = &bytes[..bytes.len().min(limit.max_len)];

        let end = match window.iter().position(|&b| b == 0) {
            Some(end) => end,
            None if limit.overflow == Overflow::Truncate => window.len(),
            None => return None,
        };

        Some(Self {
            value: String::from_utf8_lossy(&window[..end]).into_owned(),
            max_len: limit.max_len,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

impl std::fmt::Display for BoundedString {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(&self.value)
    }
}

/// Blocking accessor over one guest address space.
///
/// Every read either fills the whole output or fails. A partial read is a
/// failed read.
pub trait MemoryReader {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()>;

    fn pointer_width(&self) -> PointerWidth;

    fn read_scalar<T: Pod + Default>(&mut self, addr: Address) -> Result<T>
    where
        Self: Sized,
    {
        let mut value = T::default();
        self.read_raw_into(addr, value.as_bytes_mut())?;
        Ok(value)
    }

    fn read_u32(&mut self, addr: Address) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_raw_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_pointer(&mut self, addr: Address) -> Result<Address> {
        let mut buf = [0u8; 8];
        let width = self.pointer_width().bytes();
        self.read_raw_into(addr, &mut buf[..width])?;

        let value = match width {
            4 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64,
            _ => u64::from_le_bytes(buf),
        };

        Ok(Address::from(value))
    }

    fn read_bounded_string(&mut self, addr: Address, limit: NameLimit) -> Result<BoundedString> {
        let mut buf = vec![0u8; limit.max_len];
        let mut filled = 0;

        while filled < limit.max_len {
            let cur = field_addr(addr, filled);
            let to_page = PAGE_SIZE - (cur.to_umem() as usize % PAGE_SIZE);
            let len = (limit.max_len - filled).min(to_page).min(STRING_CHUNK);

            let chunk = &mut buf[filled..filled + len];
            self.read_raw_into(cur, chunk)?;
            filled += len;

            if chunk.contains(&0) {
                break;
            }
        }

        BoundedString::from_bytes(&buf[..filled], limit)
            .ok_or(Error(ErrorOrigin::VirtualMemory, ErrorKind::OutOfBounds))
    }
}

/// Adapts a memflow view of one address space to [`MemoryReader`].
pub struct GuestView<V> {
    view: V,
    width: PointerWidth,
}

impl<V: MemoryView> GuestView<V> {
    pub fn new(view: V, width: PointerWidth) -> Self {
        Self { view, width }
    }

    pub fn into_inner(self) -> V {
        self.view
    }
}

impl<V: MemoryView> MemoryReader for GuestView<V> {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        MemoryView::read_raw_into(&mut self.view, addr, out).map_err(|_| {
            trace!("read of {} bytes at {:x} failed", out.len(), addr);
            Error(ErrorOrigin::VirtualMemory, ErrorKind::PartialData)
        })
    }

    fn pointer_width(&self) -> PointerWidth {
        self.width
    }
}

impl<T: MemoryReader + ?Sized> MemoryReader for &mut T {
    fn read_raw_into(&mut self, addr: Address, out: &mut [u8]) -> Result<()> {
        (**self).read_raw_into(addr, out)
    }

    fn pointer_width(&self) -> PointerWidth {
        (**self).pointer_width()
    }
}
