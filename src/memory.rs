//! Flat little-endian guest RAM.
//!
//! Memory is a single window `[base, base + size)` of 32-bit words. Words are atomics so
//! several cores can share one `GuestMemory` through an `Arc` without locking; byte and
//! halfword stores are read-modify-write on the containing word.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::interpreter::Bus;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("guest memory fault at {address:#010x}")]
pub struct MemoryFault {
    pub address: u32,
}

pub struct GuestMemory {
    base: u32,
    words: Box<[AtomicU32]>,
}

impl GuestMemory {
    /// `size` is rounded up to a whole word; `base` is rounded down.
    pub fn new(base: u32, size: usize) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Self {
            base: base & !3,
            words,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.words.len() * 4
    }

    pub fn contains(&self, address: u32) -> bool {
        self.slot(address).is_ok()
    }

    fn slot(&self, address: u32) -> Result<&AtomicU32, MemoryFault> {
        let index = address.wrapping_sub(self.base) as usize / 4;
        self.words.get(index).ok_or(MemoryFault { address })
    }

    /// Reads the word containing `address`.
    pub fn read_u32(&self, address: u32) -> Result<u32, MemoryFault> {
        Ok(self.slot(address)?.load(Ordering::Relaxed))
    }

    pub fn read_u16(&self, address: u32) -> Result<u16, MemoryFault> {
        let word = self.read_u32(address)?;
        Ok((word >> (8 * (address & 2))) as u16)
    }

    pub fn read_u8(&self, address: u32) -> Result<u8, MemoryFault> {
        let word = self.read_u32(address)?;
        Ok((word >> (8 * (address & 3))) as u8)
    }

    pub fn write_u32(&self, address: u32, value: u32) -> Result<(), MemoryFault> {
        self.slot(address)?.store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn write_u16(&self, address: u32, value: u16) -> Result<(), MemoryFault> {
        self.merge(address, 0xffff << (8 * (address & 2)), (value as u32) << (8 * (address & 2)))
    }

    pub fn write_u8(&self, address: u32, value: u8) -> Result<(), MemoryFault> {
        self.merge(address, 0xff << (8 * (address & 3)), (value as u32) << (8 * (address & 3)))
    }

    fn merge(&self, address: u32, mask: u32, bits: u32) -> Result<(), MemoryFault> {
        let slot = self.slot(address)?;
        let mut current = slot.load(Ordering::Relaxed);
        loop {
            match slot.compare_exchange_weak(
                current,
                (current & !mask) | bits,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    /// Copies a raw image into memory at `address`.
    pub fn load_image(&self, address: u32, image: &[u8]) -> Result<(), MemoryFault> {
        for (i, &byte) in image.iter().enumerate() {
            self.write_u8(address.wrapping_add(i as u32), byte)?;
        }
        Ok(())
    }
}

impl Bus for GuestMemory {
    fn read_u8(&self, address: u32) -> Result<u8, MemoryFault> {
        GuestMemory::read_u8(self, address)
    }

    fn read_u16(&self, address: u32) -> Result<u16, MemoryFault> {
        GuestMemory::read_u16(self, address)
    }

    fn read_u32(&self, address: u32) -> Result<u32, MemoryFault> {
        GuestMemory::read_u32(self, address)
    }

    fn write_u8(&self, address: u32, value: u8) -> Result<(), MemoryFault> {
        GuestMemory::write_u8(self, address, value)
    }

    fn write_u16(&self, address: u32, value: u16) -> Result<(), MemoryFault> {
        GuestMemory::write_u16(self, address, value)
    }

    fn write_u32(&self, address: u32, value: u32) -> Result<(), MemoryFault> {
        GuestMemory::write_u32(self, address, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_sub_word_access() {
        let mem = GuestMemory::new(0x1000, 16);
        mem.write_u32(0x1004, 0x1122_3344).unwrap();
        assert_eq!(mem.read_u8(0x1004).unwrap(), 0x44);
        assert_eq!(mem.read_u8(0x1007).unwrap(), 0x11);
        assert_eq!(mem.read_u16(0x1006).unwrap(), 0x1122);

        mem.write_u8(0x1005, 0xaa).unwrap();
        mem.write_u16(0x1006, 0xbeef).unwrap();
        assert_eq!(mem.read_u32(0x1004).unwrap(), 0xbeef_aa44);
    }

    #[test]
    fn out_of_range_faults() {
        let mem = GuestMemory::new(0x1000, 8);
        assert_eq!(mem.read_u32(0x1008), Err(MemoryFault { address: 0x1008 }));
        assert_eq!(mem.read_u32(0x0ffc), Err(MemoryFault { address: 0x0ffc }));
        assert!(mem.contains(0x1007));
        assert!(!mem.contains(0x1008));
    }

    #[test]
    fn loads_images_at_unaligned_offsets() {
        let mem = GuestMemory::new(0, 8);
        mem.load_image(1, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read_u32(0).unwrap(), 0x0302_0100);
        assert_eq!(mem.read_u32(4).unwrap(), 0x0000_0004);
        assert!(mem.load_image(6, &[0; 4]).is_err());
    }
}
