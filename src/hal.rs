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

pub use memory_addr::{PhysAddr as HostPhysAddr, VirtAddr as HostVirtAddr};

/// The memory services this crate needs from the underlying kernel or hypervisor.
///
/// Frames handed out must be 4 KiB in size, 4 KiB aligned and physically contiguous.
/// This crate never manages physical memory itself.
pub trait VmxHal {
    /// Allocates a frame and returns its physical address, or `None` when out of memory.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Returns a frame previously obtained from [`VmxHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Converts a host physical address to a host virtual address this core can access.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;
}
