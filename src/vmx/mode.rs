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

//! The per-core VMX mode machine.
//!
//! Each mode is a type parameter of [`VmxCpu`], and every transition is a method that only
//! exists on its source mode. Skipping a step does not compile:
//!
//! ```compile_fail
//! use x86_vmx::{Disabled, GeneralRegisters, VmxCpu, VmxHal, VmxPlatform};
//!
//! fn launch_too_early<P: VmxPlatform, H: VmxHal>(mut cpu: VmxCpu<'_, P, H, Disabled>) {
//!     let _ = cpu.launch(&mut GeneralRegisters::default());
//! }
//! ```
//!
//! ```compile_fail
//! use x86_vmx::{Disabled, VmxCpu, VmxHal, VmxPlatform, VmxonRegion};
//!
//! fn skip_enable<P: VmxPlatform, H: VmxHal>(cpu: VmxCpu<'_, P, H, Disabled>, r: VmxonRegion<H>) {
//!     let _ = cpu.enter_root(r);
//! }
//! ```
//!
//! ```compile_fail
//! use x86_vmx::{Enabled, VmxCpu, VmxHal, VmxPlatform};
//!
//! fn exit_twice<P: VmxPlatform, H: VmxHal>(cpu: VmxCpu<'_, P, H, Enabled>) {
//!     let _ = cpu.exit_root();
//! }
//! ```

use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;

use x86_64::registers::control::Cr4Flags;

use super::as_vmx_error;
use super::capability::CapabilitySnapshot;
use super::definitions::{VmxInstructionError, VmxRawExitReason};
use super::region::{VmcsRegion, VmxonRegion};
use super::structs::{FeatureControlFlags, VmxBasic};
use super::vmcs::{self, VmcsReadable, VmcsWritable};
use crate::{GeneralRegisters, Msr, Rejected, Refused, Result, VmxError, VmxHal, VmxPlatform};

/// Where a logical core stands with respect to VMX operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeState {
    /// CR4.VMXE is clear.
    Disabled,
    /// CR4.VMXE is set, `VMXON` not executed yet.
    Enabled,
    /// VMX root operation.
    Root,
    /// Guest code is running. Only exists between a successful VM entry and the next
    /// VM exit, so no caller ever observes it.
    NonRoot,
}

mod sealed {
    pub trait Sealed {}
}

/// A compile-time mode of a [`VmxCpu`].
pub trait Mode: sealed::Sealed {
    const STATE: ModeState;
}

/// CR4.VMXE clear.
#[derive(Debug)]
pub struct Disabled;

/// CR4.VMXE set and the processor checked to accept VMX operation.
#[derive(Debug)]
pub struct Enabled;

/// VMX root operation.
#[derive(Debug)]
pub struct Root;

impl sealed::Sealed for Disabled {}
impl sealed::Sealed for Enabled {}
impl sealed::Sealed for Root {}

impl Mode for Disabled {
    const STATE: ModeState = ModeState::Disabled;
}

impl Mode for Enabled {
    const STATE: ModeState = ModeState::Enabled;
}

impl Mode for Root {
    const STATE: ModeState = ModeState::Root;
}

/// The VMCS currently loaded on a core.
struct Current<H: VmxHal> {
    region: VmcsRegion<H>,
    launched: bool,
}

/// One logical core in mode `S`.
///
/// The core owns its platform handle, the VMXON region while in root operation, and the
/// current VMCS. It is neither `Send` nor `Sync`: VMX state belongs to the core that
/// created it.
pub struct VmxCpu<'a, P: VmxPlatform, H: VmxHal, S: Mode> {
    platform: P,
    caps: &'a CapabilitySnapshot,
    cpu_id: usize,
    vmxon: Option<VmxonRegion<H>>,
    current: Option<Current<H>>,
    _mode: PhantomData<S>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, P: VmxPlatform, H: VmxHal, S: Mode> VmxCpu<'a, P, H, S> {
    pub fn mode(&self) -> ModeState {
        S::STATE
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn capabilities(&self) -> &'a CapabilitySnapshot {
        self.caps
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Move every field into a core of mode `T`.
    fn retag<T: Mode>(self) -> VmxCpu<'a, P, H, T> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped and each field is read exactly once.
        unsafe {
            VmxCpu {
                platform: core::ptr::read(&this.platform),
                caps: this.caps,
                cpu_id: this.cpu_id,
                vmxon: core::ptr::read(&this.vmxon),
                current: core::ptr::read(&this.current),
                _mode: PhantomData,
                _not_send: PhantomData,
            }
        }
    }

    fn clear_vmxe(&mut self) {
        let cr4 = self.platform.read_cr4() & !Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        unsafe { self.platform.write_cr4(cr4) };
    }
}

impl<'a, P: VmxPlatform, H: VmxHal> VmxCpu<'a, P, H, Disabled> {
    pub fn new(platform: P, caps: &'a CapabilitySnapshot, cpu_id: usize) -> Self {
        Self {
            platform,
            caps,
            cpu_id,
            vmxon: None,
            current: None,
            _mode: PhantomData,
            _not_send: PhantomData,
        }
    }

    /// Give the platform handle back.
    pub fn into_platform(self) -> P {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped; a disabled core owns no region.
        unsafe { core::ptr::read(&this.platform) }
    }

    /// Check that this core can enter VMX operation and set CR4.VMXE.
    ///
    /// Locks `IA32_FEATURE_CONTROL` with VMXON outside SMX enabled if firmware left it
    /// unlocked.
    pub fn enable(mut self) -> core::result::Result<VmxCpu<'a, P, H, Enabled>, Rejected<Self>> {
        match self.check_and_prepare() {
            Ok(cr4) => {
                unsafe { self.platform.write_cr4(cr4) };
                info!("[VMX] CPU {} enabled VMX (CR4.VMXE set)", self.cpu_id);
                Ok(self.retag())
            }
            Err(err) => {
                warn!("[VMX] CPU {} cannot enable VMX: {}", self.cpu_id, err);
                Err(Rejected::new(self, err))
            }
        }
    }

    /// Returns the CR4 value to program.
    fn check_and_prepare(&mut self) -> Result<u64> {
        if !self.caps.supported || !self.platform.vmx_present() {
            return Err(VmxError::Unsupported("VMX"));
        }

        // Enable VMXON, if required.
        let ctrl = FeatureControlFlags::from_bits_retain(
            self.platform.read_msr(Msr::IA32_FEATURE_CONTROL),
        );
        let locked = ctrl.contains(FeatureControlFlags::LOCKED);
        let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
        if !locked {
            let ctrl =
                ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX;
            unsafe {
                self.platform
                    .write_msr(Msr::IA32_FEATURE_CONTROL, ctrl.bits())
            };
        } else if !vmxon_outside {
            return Err(VmxError::Unsupported("VMX disabled by BIOS"));
        }

        // Check control registers are in a VMX-friendly state. (SDM Vol. 3C, Appendix A.7, A.8)
        let cr0 = self.platform.read_cr0();
        if !self.caps.cr0_fixed.admits(cr0) {
            return Err(VmxError::FixedBitsViolated("CR0"));
        }
        let cr4 = self.platform.read_cr4() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS.bits();
        if !self.caps.cr4_fixed.admits(cr4) {
            return Err(VmxError::FixedBitsViolated("CR4"));
        }

        // Check VMX basic capabilities. (SDM Vol. 3D, Appendix A.1)
        let basic = &self.caps.basic;
        if basic.region_size as usize > memory_addr::PAGE_SIZE_4K {
            return Err(VmxError::Unsupported("VMX region size larger than 4K"));
        }
        if basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
            return Err(VmxError::Unsupported("VMX memory type is not write-back"));
        }
        if basic.is_32bit_address {
            return Err(VmxError::Unsupported("32-bit VMX regions"));
        }
        Ok(cr4)
    }
}

impl<'a, P: VmxPlatform, H: VmxHal> VmxCpu<'a, P, H, Enabled> {
    /// Execute `VMXON` with a stamped region.
    ///
    /// On success the core keeps the region until [`VmxCpu::exit_root`].
    #[allow(clippy::type_complexity)]
    pub fn enter_root(
        mut self,
        region: VmxonRegion<H>,
    ) -> core::result::Result<VmxCpu<'a, P, H, Root>, Rejected<(Self, VmxonRegion<H>)>> {
        let paddr = region.phys_addr();
        if let Err(fail) = unsafe { self.platform.vmxon(paddr) } {
            let err = as_vmx_error(&self.platform, fail);
            warn!("[VMX] CPU {} VMXON {:#x} failed: {}", self.cpu_id, paddr, err);
            return Err(Rejected::new((self, region), err));
        }
        info!("[VMX] CPU {} entered VMX root operation", self.cpu_id);
        self.vmxon = Some(region);
        Ok(self.retag())
    }

    /// Clear CR4.VMXE.
    pub fn disable(mut self) -> VmxCpu<'a, P, H, Disabled> {
        self.clear_vmxe();
        info!("[VMX] CPU {} disabled VMX", self.cpu_id);
        self.retag()
    }
}

impl<'a, P: VmxPlatform, H: VmxHal> VmxCpu<'a, P, H, Root> {
    /// Execute `VMXOFF` and hand back the VMXON region.
    ///
    /// The current VMCS must be cleared first, otherwise fails with
    /// [`VmxError::RegionBusy`].
    #[allow(clippy::type_complexity)]
    pub fn exit_root(
        mut self,
    ) -> core::result::Result<(VmxCpu<'a, P, H, Enabled>, VmxonRegion<H>), Rejected<Self>> {
        if self.current.is_some() {
            warn!("[VMX] CPU {} VMXOFF with a current VMCS", self.cpu_id);
            return Err(Rejected::new(self, VmxError::RegionBusy));
        }
        if let Err(fail) = unsafe { self.platform.vmxoff() } {
            let err = as_vmx_error(&self.platform, fail);
            warn!("[VMX] CPU {} VMXOFF failed: {}", self.cpu_id, err);
            return Err(Rejected::new(self, err));
        }
        info!("[VMX] CPU {} left VMX root operation", self.cpu_id);
        let Some(region) = self.vmxon.take() else {
            unreachable!("root operation without a VMXON region")
        };
        Ok((self.retag(), region))
    }

    /// Make `region` the current VMCS and fill in its host-state area.
    ///
    /// Only one VMCS can be current: loading while another one is current is refused with
    /// [`VmxError::RegionBusy`].
    pub fn load(&mut self, region: VmcsRegion<H>) -> core::result::Result<(), Refused<VmcsRegion<H>>> {
        if self.current.is_some() {
            return Err(Refused {
                region,
                error: VmxError::RegionBusy,
            });
        }
        let paddr = region.phys_addr();
        if let Err(fail) = unsafe { self.platform.vmptrld(paddr) } {
            let error = as_vmx_error(&self.platform, fail);
            warn!("[VMX] CPU {} VMPTRLD {:#x} failed: {}", self.cpu_id, paddr, error);
            return Err(Refused { region, error });
        }
        if let Err(fail) = unsafe { self.platform.write_host_state() } {
            let error = as_vmx_error(&self.platform, fail);
            warn!("[VMX] CPU {} host state setup failed: {}", self.cpu_id, error);
            if let Err(fail) = unsafe { self.platform.vmclear(paddr) } {
                warn!(
                    "[VMX] CPU {} VMCLEAR {:#x} after failed load failed: {}",
                    self.cpu_id,
                    paddr,
                    as_vmx_error(&self.platform, fail)
                );
            }
            return Err(Refused { region, error });
        }
        debug!("[VMX] CPU {} loaded VMCS {:#x}", self.cpu_id, paddr);
        self.current = Some(Current {
            region,
            launched: false,
        });
        Ok(())
    }

    /// `VMCLEAR` the current VMCS and hand it back.
    ///
    /// The region keeps its stamp and can be loaded again.
    pub fn clear_current(&mut self) -> Result<VmcsRegion<H>> {
        let paddr = match &self.current {
            Some(current) => current.region.phys_addr(),
            None => return Err(VmxError::InvalidFailure),
        };
        unsafe { self.platform.vmclear(paddr) }.map_err(|fail| as_vmx_error(&self.platform, fail))?;
        debug!("[VMX] CPU {} cleared VMCS {:#x}", self.cpu_id, paddr);
        match self.current.take() {
            Some(current) => Ok(current.region),
            None => Err(VmxError::InvalidFailure),
        }
    }

    /// `VMCLEAR` a region that is not current on this core.
    pub fn clear(&mut self, region: &VmcsRegion<H>) -> Result {
        unsafe { self.platform.vmclear(region.phys_addr()) }
            .map_err(|fail| as_vmx_error(&self.platform, fail))?;
        debug!("[VMX] CPU {} cleared VMCS {:#x}", self.cpu_id, region.phys_addr());
        Ok(())
    }

    pub fn current_region(&self) -> Option<&VmcsRegion<H>> {
        self.current.as_ref().map(|c| &c.region)
    }

    /// Whether the current VMCS has been entered with `VMLAUNCH` since it was loaded.
    pub fn is_launched(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.launched)
    }

    /// Enter the guest of a clear VMCS and return after the next VM exit.
    ///
    /// A VMCS that has already been launched is rejected with
    /// [`VmxInstructionError::VMLAUNCH_NON_CLEAR_VMCS`] without touching the processor.
    pub fn launch(&mut self, regs: &mut GeneralRegisters) -> Result<VmxRawExitReason> {
        match &self.current {
            None => return Err(VmxError::InvalidFailure),
            Some(c) if c.launched => {
                return Err(VmxError::ValidFailure(
                    VmxInstructionError::VMLAUNCH_NON_CLEAR_VMCS,
                ));
            }
            Some(_) => {}
        }
        unsafe { self.platform.vmlaunch(regs) }
            .map_err(|fail| as_vmx_error(&self.platform, fail))?;
        self.after_exit()
    }

    /// Re-enter the guest of a launched VMCS and return after the next VM exit.
    pub fn resume(&mut self, regs: &mut GeneralRegisters) -> Result<VmxRawExitReason> {
        match &self.current {
            None => return Err(VmxError::InvalidFailure),
            Some(c) if !c.launched => {
                return Err(VmxError::ValidFailure(
                    VmxInstructionError::VMRESUME_NON_LAUNCHED_VMCS,
                ));
            }
            Some(_) => {}
        }
        unsafe { self.platform.vmresume(regs) }
            .map_err(|fail| as_vmx_error(&self.platform, fail))?;
        self.after_exit()
    }

    /// Back in root operation after an entry attempt that reached the exit path.
    fn after_exit(&mut self) -> Result<VmxRawExitReason> {
        let reason =
            vmcs::exit_reason(&self.platform).map_err(|fail| as_vmx_error(&self.platform, fail))?;
        // A failed VM entry leaves the launch state untouched. (SDM Vol. 3C, Section 27.8)
        if !reason.entry_failure() {
            if let Some(current) = self.current.as_mut() {
                current.launched = true;
            }
        }
        Ok(reason)
    }

    /// `VMREAD` a field of the current VMCS.
    pub fn read<F: VmcsReadable>(&self, field: F) -> Result<F::Value> {
        if self.current.is_none() {
            return Err(VmxError::InvalidFailure);
        }
        self.platform
            .vmread(field.encoding())
            .map(F::decode)
            .map_err(|fail| as_vmx_error(&self.platform, fail))
    }

    /// `VMWRITE` a field of the current VMCS.
    pub fn write<F: VmcsWritable>(&mut self, field: F, value: F::Value) -> Result {
        if self.current.is_none() {
            return Err(VmxError::InvalidFailure);
        }
        unsafe { self.platform.vmwrite(field.encoding(), F::encode(value)) }
            .map_err(|fail| as_vmx_error(&self.platform, fail))
    }
}

impl<P: VmxPlatform, H: VmxHal, S: Mode> Drop for VmxCpu<'_, P, H, S> {
    fn drop(&mut self) {
        match S::STATE {
            ModeState::Root => {
                warn!("[VMX] CPU {} dropped in VMX root operation", self.cpu_id);
                if let Some(current) = self.current.take() {
                    let _ = unsafe { self.platform.vmclear(current.region.phys_addr()) };
                }
                if unsafe { self.platform.vmxoff() }.is_err() {
                    // Keep the VMXON region alive: the processor may still use it.
                    if let Some(region) = self.vmxon.take() {
                        core::mem::forget(region);
                    }
                    return;
                }
                self.clear_vmxe();
            }
            ModeState::Enabled => self.clear_vmxe(),
            ModeState::Disabled | ModeState::NonRoot => {}
        }
    }
}

impl<P: VmxPlatform, H: VmxHal, S: Mode> fmt::Debug for VmxCpu<'_, P, H, S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VmxCpu")
            .field("cpu_id", &self.cpu_id)
            .field("mode", &S::STATE)
            .field("vmxon", &self.vmxon)
            .field("current", &self.current.as_ref().map(|c| &c.region))
            .field("launched", &self.current.as_ref().is_some_and(|c| c.launched))
            .finish()
    }
}
