//! Host-side linear memory and the bump allocator behind it.
//!
//! The memory is partitioned bottom-up into a static zone (globals and the
//! dynamic-top word), a fixed-size stack zone, and a growable dynamic zone.
//! `sbrk` bumps the dynamic top; the host-side `malloc` used by the
//! marshaller rounds requests up to 16 bytes and goes through it, the same
//! contract the compiled module's exported allocator follows.

use serde::{Deserialize, Serialize};

use crate::errors::{HastyError, HastyResult};

pub const WASM_PAGE_SIZE: u32 = 64 * 1024;
/// The format's hard address-space ceiling (i32 addressability).
pub const MAX_MEMORY: u64 = 2 * 1024 * 1024 * 1024;
/// Below this capacity growth doubles; above it, growth takes a quarter of
/// the remaining headroom.
pub const GROWTH_KNEE: u32 = 16 * 1024 * 1024;

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub total_stack: u32,
    pub initial_memory: u32,
    pub global_base: u32,
    pub static_bump: u32,
}

impl Default for LoaderConfig {
    fn default() -> LoaderConfig {
        LoaderConfig {
            total_stack: 5 * 1024 * 1024,
            initial_memory: 16 * 1024 * 1024,
            global_base: 1024,
            static_bump: 0,
        }
    }
}

fn align16(n: u32) -> u32 {
    (n + 15) & !15
}

/// A flat byte-addressable region with typed accessors. All accesses are
/// bounds-checked against the current capacity.
pub struct LinearMemory {
    bytes: Vec<u8>,
}

impl LinearMemory {
    pub fn new(size: u32) -> LinearMemory {
        LinearMemory {
            bytes: vec![0; size as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn grow_to(&mut self, size: u32) {
        if size as usize > self.bytes.len() {
            self.bytes.resize(size as usize, 0);
        }
    }

    fn check(&self, addr: u32, len: u32) -> HastyResult<usize> {
        let end = addr as u64 + len as u64;
        if end > self.bytes.len() as u64 {
            return Err(HastyError::memory(format!(
                "access at {:#x}+{} is outside of memory (capacity {:#x})",
                addr,
                len,
                self.bytes.len()
            )));
        }
        Ok(addr as usize)
    }

    pub fn read_i8(&self, addr: u32) -> HastyResult<i8> {
        let i = self.check(addr, 1)?;
        Ok(self.bytes[i] as i8)
    }

    pub fn write_i8(&mut self, addr: u32, value: i8) -> HastyResult {
        let i = self.check(addr, 1)?;
        self.bytes[i] = value as u8;
        Ok(())
    }

    pub fn read_i32(&self, addr: u32) -> HastyResult<i32> {
        let i = self.check(addr, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[i..i + 4]);
        Ok(i32::from_le_bytes(buf))
    }

    pub fn write_i32(&mut self, addr: u32, value: i32) -> HastyResult {
        let i = self.check(addr, 4)?;
        self.bytes[i..i + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_f64(&self, addr: u32) -> HastyResult<f64> {
        let i = self.check(addr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[i..i + 8]);
        Ok(f64::from_le_bytes(buf))
    }

    pub fn write_f64(&mut self, addr: u32, value: f64) -> HastyResult {
        let i = self.check(addr, 8)?;
        self.bytes[i..i + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_bytes(&self, addr: u32, len: u32) -> HastyResult<&[u8]> {
        let i = self.check(addr, len)?;
        Ok(&self.bytes[i..i + len as usize])
    }

    pub fn write_bytes(&mut self, addr: u32, src: &[u8]) -> HastyResult {
        let i = self.check(addr, src.len() as u32)?;
        self.bytes[i..i + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// The partitioned memory plus its allocation state.
pub struct Heap {
    pub mem: LinearMemory,
    /// Base of the stack zone; supplied to the module as `STACKTOP`.
    /// Compiled frames bump upward from here, so the dynamic zone must sit
    /// past `stack_base + total_stack`.
    stack_base: u32,
    /// Address of the word holding the dynamic-zone top.
    dynamic_top_ptr: u32,
}

impl Heap {
    pub fn new(config: &LoaderConfig) -> HastyResult<Heap> {
        let mut mem = LinearMemory::new(config.initial_memory);
        let static_top = config.global_base + config.static_bump;
        let dynamic_top_ptr = static_top;
        let stack_base = align16(static_top + 4);
        let stack_limit = stack_base + config.total_stack;
        let dynamic_base = align16(stack_limit);

        mem.write_i32(dynamic_top_ptr, dynamic_base as i32)?;
        log::debug!(
            "heap layout: stack {:#x}..{:#x}, dynamic base {:#x}",
            stack_base,
            stack_limit,
            dynamic_base
        );
        Ok(Heap {
            mem,
            stack_base,
            dynamic_top_ptr,
        })
    }

    pub fn stack_base(&self) -> u32 {
        self.stack_base
    }

    /// Bumps the dynamic top by `increment` (rounded up to 16 bytes) and
    /// returns the old top, growing the memory if the new top passes its
    /// capacity. Address-space exhaustion is fatal, not retryable.
    pub fn sbrk(&mut self, increment: i32) -> HastyResult<u32> {
        let increment = increment.wrapping_add(15) & -16;
        let old_top = self.mem.read_i32(self.dynamic_top_ptr)?;
        let new_top = old_top.wrapping_add(increment);
        if (increment > 0 && new_top < old_top) || new_top < 0 {
            return Err(HastyError::memory(str!(
                "allocation would wrap the 32-bit address space"
            )));
        }
        self.mem.write_i32(self.dynamic_top_ptr, new_top)?;
        if new_top as u32 > self.mem.capacity() {
            self.grow(new_top as u32)?;
        }
        Ok(old_top as u32)
    }

    /// Grows capacity to cover `required`: doubling below the knee, then a
    /// quarter of the remaining headroom, page-aligned, never past the
    /// ceiling.
    fn grow(&mut self, required: u32) -> HastyResult {
        let mut capacity = self.mem.capacity() as u64;
        while (required as u64) > capacity {
            let step = if capacity < GROWTH_KNEE as u64 {
                capacity
            } else {
                (MAX_MEMORY - capacity) / 4
            };
            let step = ((step + WASM_PAGE_SIZE as u64 - 1) / WASM_PAGE_SIZE as u64)
                * WASM_PAGE_SIZE as u64;
            if step == 0 || capacity + step > MAX_MEMORY {
                return Err(HastyError::memory(format!(
                    "memory limit exhausted: {} bytes requested, ceiling is {} bytes",
                    required, MAX_MEMORY
                )));
            }
            capacity += step;
        }
        log::debug!("growing memory to {} bytes", capacity);
        self.mem.grow_to(capacity as u32);
        Ok(())
    }

    /// Host-side `malloc`: a 16-byte-rounded bump through `sbrk`.
    pub fn alloc(&mut self, size: u32) -> HastyResult<u32> {
        self.sbrk(size as i32)
    }

    /// Host-side `free` is a no-op; storage is reclaimed wholesale when the
    /// module is dropped.
    pub fn free(&mut self, _ptr: u32) {}
}

#[cfg(test)]
mod memory_test {
    use super::*;

    fn small_heap() -> Heap {
        Heap::new(&LoaderConfig {
            total_stack: 4096,
            initial_memory: 64 * 1024,
            global_base: 1024,
            static_bump: 16,
        })
        .unwrap()
    }

    #[test]
    fn test_layout() {
        let heap = small_heap();
        // the dynamic-top word sits at 1024 + 16; the stack starts past it
        assert_eq!(heap.stack_base(), 1056);
        // the dynamic zone starts right after the stack, aligned
        assert_eq!(heap.mem.read_i32(1040).unwrap(), 5152);
    }

    #[test]
    fn test_stack_zone_and_dynamic_zone_are_disjoint() {
        let mut heap = small_heap();
        // frames bump upward from the stack base; the first allocation must
        // land at or above the end of the reserved stack zone
        let first = heap.sbrk(0).unwrap();
        assert!(first >= heap.stack_base() + 4096);
    }

    #[test]
    fn test_sbrk_rounds_and_bumps() {
        let mut heap = small_heap();
        let first = heap.alloc(3).unwrap();
        let second = heap.alloc(3).unwrap();
        assert_eq!(second - first, 16);
    }

    #[test]
    fn test_sbrk_triggers_growth() {
        let mut heap = small_heap();
        let before = heap.mem.capacity();
        heap.alloc(2 * before).unwrap();
        assert!(heap.mem.capacity() >= 2 * before);
    }

    #[test]
    fn test_wraparound_is_fatal() {
        let mut heap = small_heap();
        assert!(heap.sbrk(i32::max_value()).is_err());
    }

    #[test]
    fn test_bounds_check() {
        let mem = LinearMemory::new(16);
        assert!(mem.read_i32(12).is_ok());
        assert!(mem.read_i32(13).is_err());
        assert!(mem.read_f64(16).is_err());
    }
}
