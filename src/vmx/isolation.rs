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

use core::sync::atomic::{AtomicU32, Ordering};

use super::as_vmx_error;
use super::definitions::VmxInstructionError;
use super::instructions::{InvEptType, InvVpidType};
use super::mode::{Root, VmxCpu};
use crate::{Result, VmxError, VmxHal, VmxPlatform};

/// A virtual-processor identifier (VPID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsolationTag(u16);

impl IsolationTag {
    /// VPID 0 tags the host's own translations.
    pub const HOST: Self = Self(0);

    pub const fn as_u16(&self) -> u16 {
        self.0
    }

    pub const fn is_host(&self) -> bool {
        self.0 == 0
    }
}

impl From<IsolationTag> for u16 {
    fn from(tag: IsolationTag) -> u16 {
        tag.0
    }
}

/// Hands out VPIDs 1, 2, 3, ... shared by all cores.
///
/// Tags are never reused: once `u16::MAX` has been handed out every further request
/// fails with [`VmxError::TagsExhausted`].
#[derive(Debug)]
pub struct VpidAllocator {
    next: AtomicU32,
}

impl VpidAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn allocate_tag(&self) -> Result<IsolationTag> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                (next <= u16::MAX as u32).then_some(next + 1)
            })
            .map(|tag| IsolationTag(tag as u16))
            .map_err(|_| {
                warn!("[VMX] VPIDs exhausted");
                VmxError::TagsExhausted
            })
    }

    /// How many tags have been handed out.
    pub fn allocated(&self) -> u32 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for VpidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: VmxPlatform, H: VmxHal> VmxCpu<'_, P, H, Root> {
    /// Invalidate EPT-derived translations, for one EPTP or for all of them.
    pub fn invalidate_ept(&mut self, eptp: u64, kind: InvEptType) -> Result {
        if !self.capabilities().isolation.supports_invept(kind) {
            return Err(VmxError::Unsupported("INVEPT type"));
        }
        let descriptor = [eptp, 0];
        unsafe { self.platform_mut().invept(kind, &descriptor) }
            .map_err(|fail| as_vmx_error(self.platform(), fail))?;
        trace!("[VMX] CPU {} INVEPT {:?} {:#x}", self.cpu_id(), kind, eptp);
        Ok(())
    }

    /// Invalidate translations tagged with a VPID.
    ///
    /// `address` only matters for [`InvVpidType::IndividualAddress`]. The host tag can only
    /// be flushed together with all others.
    pub fn invalidate_vpid(&mut self, tag: IsolationTag, kind: InvVpidType, address: u64) -> Result {
        if !self.capabilities().isolation.supports_invvpid(kind) {
            return Err(VmxError::Unsupported("INVVPID type"));
        }
        if tag.is_host() && kind != InvVpidType::AllContexts {
            return Err(VmxError::ValidFailure(
                VmxInstructionError::INVALID_INVEPT_INVVPID_OPERAND,
            ));
        }
        let descriptor = [tag.as_u16() as u64, address];
        unsafe { self.platform_mut().invvpid(kind, &descriptor) }
            .map_err(|fail| as_vmx_error(self.platform(), fail))?;
        trace!("[VMX] CPU {} INVVPID {:?} {:?}", self.cpu_id(), kind, tag);
        Ok(())
    }
}
