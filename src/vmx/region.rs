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

//! VMXON and VMCS regions.
//!
//! A region starts as a [`RawRegion`] and only becomes a [`Region`] once it carries the
//! processor's revision identifier. Nothing accepts a raw region where a stamped one is
//! required, so an unstamped region can never reach `VMXON` or `VMPTRLD`:
//!
//! ```compile_fail
//! use x86_vmx::{RawRegion, Root, Vmcs, VmxCpu, VmxHal, VmxPlatform};
//!
//! fn load_unstamped<P: VmxPlatform, H: VmxHal>(
//!     cpu: &mut VmxCpu<'_, P, H, Root>,
//!     raw: RawRegion<H, Vmcs>,
//! ) {
//!     let _ = cpu.load(raw);
//! }
//! ```
//!
//! ```
//! use x86_vmx::{CapabilitySnapshot, RawRegion, Root, Vmcs, VmxCpu, VmxHal, VmxPlatform};
//!
//! fn load_stamped<P: VmxPlatform, H: VmxHal>(
//!     cpu: &mut VmxCpu<'_, P, H, Root>,
//!     raw: RawRegion<H, Vmcs>,
//!     caps: &CapabilitySnapshot,
//! ) {
//!     let _ = cpu.load(raw.stamp(caps));
//! }
//! ```

use core::fmt;
use core::marker::PhantomData;

use super::capability::CapabilitySnapshot;
use crate::{HostPhysAddr, PhysFrame, Result, VmxHal};

mod sealed {
    pub trait Sealed {}
}

/// The two kinds of VMX regions.
pub trait RegionKind: sealed::Sealed {
    const NAME: &'static str;
}

/// The per-core region handed to `VMXON`.
#[derive(Debug)]
pub struct Vmxon;

/// A virtual-machine control structure.
#[derive(Debug)]
pub struct Vmcs;

impl sealed::Sealed for Vmxon {}
impl sealed::Sealed for Vmcs {}

impl RegionKind for Vmxon {
    const NAME: &'static str = "VMXON";
}

impl RegionKind for Vmcs {
    const NAME: &'static str = "VMCS";
}

/// A zeroed region that has not been stamped with a revision identifier yet.
pub struct RawRegion<H: VmxHal, K: RegionKind> {
    frame: PhysFrame<H>,
    _kind: PhantomData<K>,
}

/// A region carrying the revision identifier of this processor.
pub struct Region<H: VmxHal, K: RegionKind> {
    frame: PhysFrame<H>,
    revision: u32,
    _kind: PhantomData<K>,
}

pub type VmxonRegion<H> = Region<H, Vmxon>;
pub type VmcsRegion<H> = Region<H, Vmcs>;

impl<H: VmxHal, K: RegionKind> RawRegion<H, K> {
    /// Allocate one zeroed 4 KiB frame from the memory collaborator.
    pub fn alloc() -> Result<Self> {
        Ok(Self::from_frame(PhysFrame::alloc_zero()?))
    }

    pub fn from_frame(frame: PhysFrame<H>) -> Self {
        Self {
            frame,
            _kind: PhantomData,
        }
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    /// Zero the region and write the revision identifier into its first 4 bytes.
    ///
    /// Bit 31 of that word stays clear: it marks shadow VMCSs, which are not used here.
    pub fn stamp(mut self, caps: &CapabilitySnapshot) -> Region<H, K> {
        let revision = caps.region_format_revision() & 0x7fff_ffff;
        self.frame.fill(0);
        self.frame.write_u32(0, revision);
        debug!(
            "[VMX] stamped {} region {:#x} with revision {:#x}",
            K::NAME,
            self.frame.start_paddr(),
            revision
        );
        Region {
            frame: self.frame,
            revision,
            _kind: PhantomData,
        }
    }

    /// Release the underlying frame.
    pub fn into_frame(self) -> PhysFrame<H> {
        self.frame
    }
}

impl<H: VmxHal, K: RegionKind> Region<H, K> {
    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    /// The revision identifier this region was stamped with.
    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// The identifier currently stored in the region's first word.
    pub fn stored_revision(&self) -> u32 {
        self.frame.read_u32(0)
    }

    /// Drop the stamp so the region can be stamped again.
    pub fn into_raw(self) -> RawRegion<H, K> {
        RawRegion::from_frame(self.frame)
    }
}

impl<H: VmxHal, K: RegionKind> fmt::Debug for RawRegion<H, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RawRegion")
            .field("kind", &K::NAME)
            .field("paddr", &self.phys_addr())
            .finish()
    }
}

impl<H: VmxHal, K: RegionKind> fmt::Debug for Region<H, K> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Region")
            .field("kind", &K::NAME)
            .field("paddr", &self.phys_addr())
            .field("revision", &self.revision)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::{ExhaustedHal, MockHal, MockPlatform};
    use crate::VmxError;

    #[test]
    fn test_stamp_writes_revision() {
        let caps = CapabilitySnapshot::detect(&MockPlatform::new()).unwrap();
        let mut raw = RawRegion::<MockHal, Vmcs>::alloc().unwrap();
        // Leftover content from a previous user must not survive stamping.
        raw.frame.fill(0xa5);
        let region = raw.stamp(&caps);
        assert_eq!(region.revision(), MockPlatform::REVISION);
        assert_eq!(region.stored_revision(), MockPlatform::REVISION);
        assert_eq!(region.frame.read_u32(4), 0);
    }

    #[test]
    fn test_stamp_clears_shadow_bit() {
        let mut caps = CapabilitySnapshot::detect(&MockPlatform::new()).unwrap();
        caps.basic.revision_id = 0x8000_0004;
        let region = RawRegion::<MockHal, Vmxon>::alloc().unwrap().stamp(&caps);
        assert_eq!(region.stored_revision(), 4);
    }

    #[test]
    fn test_restamp_keeps_frame() {
        let caps = CapabilitySnapshot::detect(&MockPlatform::new()).unwrap();
        let region = RawRegion::<MockHal, Vmcs>::alloc().unwrap().stamp(&caps);
        let paddr = region.phys_addr();
        let again = region.into_raw().stamp(&caps);
        assert_eq!(again.phys_addr(), paddr);
        assert_eq!(again.stored_revision(), MockPlatform::REVISION);
    }

    #[test]
    fn test_region_frees_frame_on_drop() {
        let before = MockHal::live_frames();
        let region = RawRegion::<MockHal, Vmcs>::alloc().unwrap();
        assert_eq!(MockHal::live_frames(), before + 1);
        drop(region);
        assert_eq!(MockHal::live_frames(), before);
    }

    #[test]
    fn test_alloc_failure() {
        assert_eq!(
            RawRegion::<ExhaustedHal, Vmxon>::alloc().unwrap_err(),
            VmxError::NoMemory
        );
    }
}
