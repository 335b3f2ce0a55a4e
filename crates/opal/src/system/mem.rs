//! Emulated RDRAM, as seen by the graphics pipeline.
//!
//! Memory is stored in guest (big endian) byte order. Every access is bounds checked.

use easyerr::Error;

pub const RDRAM_4MB: usize = 4 * bytesize::MIB as usize;
pub const RDRAM_8MB: usize = 8 * bytesize::MIB as usize;

/// Mask applied to physical addresses.
pub const ADDRESS_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("access at {f0:#010X} with length {f1} is out of bounds")]
    OutOfBounds(u32, usize),
}

pub struct Rdram {
    data: Box<[u8]>,
}

impl Rdram {
    /// Creates a zeroed RDRAM of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len].into_boxed_slice(),
        }
    }

    /// Wraps an existing memory image.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn ram(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Whether `len` bytes starting at `address` are inside RDRAM.
    #[inline(always)]
    pub fn contains(&self, address: u32, len: usize) -> bool {
        (address as usize)
            .checked_add(len)
            .is_some_and(|end| end <= self.data.len())
    }

    #[inline(always)]
    pub fn slice(&self, address: u32, len: usize) -> Result<&[u8], MemoryError> {
        let start = address as usize;
        start
            .checked_add(len)
            .and_then(|end| self.data.get(start..end))
            .ok_or(MemoryError::OutOfBounds(address, len))
    }

    #[inline(always)]
    pub fn slice_mut(&mut self, address: u32, len: usize) -> Result<&mut [u8], MemoryError> {
        let start = address as usize;
        start
            .checked_add(len)
            .and_then(|end| self.data.get_mut(start..end))
            .ok_or(MemoryError::OutOfBounds(address, len))
    }

    #[inline(always)]
    fn array<const N: usize>(&self, address: u32) -> Result<[u8; N], MemoryError> {
        let mut out = [0; N];
        out.copy_from_slice(self.slice(address, N)?);
        Ok(out)
    }

    #[inline(always)]
    pub fn read_u8(&self, address: u32) -> Result<u8, MemoryError> {
        self.data
            .get(address as usize)
            .copied()
            .ok_or(MemoryError::OutOfBounds(address, 1))
    }

    #[inline(always)]
    pub fn read_i8(&self, address: u32) -> Result<i8, MemoryError> {
        self.read_u8(address).map(|x| x as i8)
    }

    #[inline(always)]
    pub fn read_u16(&self, address: u32) -> Result<u16, MemoryError> {
        self.array(address).map(u16::from_be_bytes)
    }

    #[inline(always)]
    pub fn read_i16(&self, address: u32) -> Result<i16, MemoryError> {
        self.array(address).map(i16::from_be_bytes)
    }

    #[inline(always)]
    pub fn read_u32(&self, address: u32) -> Result<u32, MemoryError> {
        self.array(address).map(u32::from_be_bytes)
    }

    /// Reads a 64-bit command as its two 32-bit words.
    #[inline(always)]
    pub fn read_command(&self, address: u32) -> Result<(u32, u32), MemoryError> {
        let bytes: [u8; 8] = self.array(address)?;
        let [a, b, c, d, e, f, g, h] = bytes;
        Ok((
            u32::from_be_bytes([a, b, c, d]),
            u32::from_be_bytes([e, f, g, h]),
        ))
    }

    #[inline(always)]
    pub fn write_u8(&mut self, address: u32, value: u8) -> Result<(), MemoryError> {
        self.slice_mut(address, 1)?[0] = value;
        Ok(())
    }

    #[inline(always)]
    pub fn write_u16(&mut self, address: u32, value: u16) -> Result<(), MemoryError> {
        self.slice_mut(address, 2)?
            .copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    #[inline(always)]
    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), MemoryError> {
        self.slice_mut(address, 4)?
            .copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

impl Default for Rdram {
    fn default() -> Self {
        Self::new(RDRAM_8MB)
    }
}

impl std::fmt::Debug for Rdram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rdram").field("len", &self.len()).finish()
    }
}
