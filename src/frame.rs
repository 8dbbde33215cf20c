// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::marker::PhantomData;

use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

use crate::{HostPhysAddr, Result, VmxError, VmxHal};

/// A 4 KiB physical frame which is returned to the [`VmxHal`] when dropped.
#[derive(Debug)]
pub struct PhysFrame<H: VmxHal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: VmxHal> PhysFrame<H> {
    /// Allocate a [`PhysFrame`].
    pub fn alloc() -> Result<Self> {
        let start_paddr = H::alloc_frame().ok_or(VmxError::NoMemory)?;
        if !memory_addr::is_aligned_4k(start_paddr.as_usize()) {
            warn!("[VMX] frame {:#x} is not 4K aligned", start_paddr);
            H::dealloc_frame(start_paddr);
            return Err(VmxError::NoMemory);
        }
        debug!("[VMX] allocated PhysFrame({:#x})", start_paddr);
        Ok(Self {
            start_paddr,
            _marker: PhantomData,
        })
    }

    /// Allocate a [`PhysFrame`] and fill it with zeros.
    pub fn alloc_zero() -> Result<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    /// Get the starting physical address of the frame.
    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    /// Get a mutable pointer to the frame.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr).as_mut_ptr()
    }

    /// Fill the whole frame with a byte.
    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }

    /// Write a little-endian `u32` at `offset` bytes into the frame.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        assert!(offset + 4 <= PAGE_SIZE);
        unsafe { (self.as_mut_ptr().add(offset) as *mut u32).write_volatile(value) }
    }

    /// Read a little-endian `u32` at `offset` bytes into the frame.
    pub fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset + 4 <= PAGE_SIZE);
        unsafe { (self.as_mut_ptr().add(offset) as *const u32).read_volatile() }
    }
}

impl<H: VmxHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        debug!("[VMX] deallocated PhysFrame({:#x})", self.start_paddr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::{ExhaustedHal, MockHal};

    #[test]
    fn test_alloc_zero_and_drop() {
        let before = MockHal::live_frames();
        let frame = PhysFrame::<MockHal>::alloc_zero().unwrap();
        assert_eq!(MockHal::live_frames(), before + 1);
        assert!(memory_addr::is_aligned_4k(frame.start_paddr().as_usize()));
        assert_eq!(frame.read_u32(0), 0);
        assert_eq!(frame.read_u32(PAGE_SIZE - 4), 0);
        drop(frame);
        assert_eq!(MockHal::live_frames(), before);
    }

    #[test]
    fn test_word_access() {
        let mut frame = PhysFrame::<MockHal>::alloc_zero().unwrap();
        frame.write_u32(8, 0xdead_beef);
        assert_eq!(frame.read_u32(8), 0xdead_beef);
        frame.fill(0xff);
        assert_eq!(frame.read_u32(8), u32::MAX);
    }

    #[test]
    fn test_alloc_failure() {
        assert_eq!(
            PhysFrame::<ExhaustedHal>::alloc().unwrap_err(),
            VmxError::NoMemory
        );
    }
}
