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

use crate::vmx::{InvEptType, InvVpidType};
use crate::{GeneralRegisters, HostPhysAddr, Msr};

/// Raw instruction outcome: `Err` carries which of the two failure flags was set.
pub type InsnResult = x86::vmx::Result<()>;

/// The processor as seen by the VMX control plane.
///
/// Every privileged instruction of the VMX family goes through this trait so that the
/// mode machine can run against real hardware ([`X86Platform`](crate::X86Platform)) or
/// an emulation in tests. Implementations report failures as raw flag outcomes; decoding
/// them into [`VmxError`](crate::VmxError) is done by the caller.
pub trait VmxPlatform {
    /// Whether `CPUID.1:ECX.VMX[bit 5]` is set.
    fn vmx_present(&self) -> bool;

    fn read_msr(&self, msr: Msr) -> u64;

    /// # Safety
    ///
    /// Writing an MSR may change processor behavior globally.
    unsafe fn write_msr(&mut self, msr: Msr, value: u64);

    fn read_cr0(&self) -> u64;

    fn read_cr4(&self) -> u64;

    /// # Safety
    ///
    /// The caller must keep the value consistent with the VMX fixed bits.
    unsafe fn write_cr4(&mut self, value: u64);

    /// Execute `VMXON` with the physical address of a stamped region.
    ///
    /// # Safety
    ///
    /// `paddr` must point to a valid, stamped VMXON region that outlives VMX operation.
    unsafe fn vmxon(&mut self, paddr: HostPhysAddr) -> InsnResult;

    /// # Safety
    ///
    /// The core must be in VMX root operation.
    unsafe fn vmxoff(&mut self) -> InsnResult;

    /// # Safety
    ///
    /// `paddr` must point to a stamped VMCS region.
    unsafe fn vmptrld(&mut self, paddr: HostPhysAddr) -> InsnResult;

    /// # Safety
    ///
    /// `paddr` must point to a VMCS region.
    unsafe fn vmclear(&mut self, paddr: HostPhysAddr) -> InsnResult;

    fn vmread(&self, field: u32) -> x86::vmx::Result<u64>;

    /// # Safety
    ///
    /// A current VMCS must be loaded; the value takes effect on the next VM entry.
    unsafe fn vmwrite(&mut self, field: u32, value: u64) -> InsnResult;

    /// Execute `VMLAUNCH` and return after the following VM exit.
    ///
    /// `regs` is loaded into the guest before entry and holds the guest values after exit.
    ///
    /// # Safety
    ///
    /// The current VMCS must describe a runnable guest.
    unsafe fn vmlaunch(&mut self, regs: &mut GeneralRegisters) -> InsnResult;

    /// Execute `VMRESUME` and return after the following VM exit.
    ///
    /// # Safety
    ///
    /// Same as [`VmxPlatform::vmlaunch`].
    unsafe fn vmresume(&mut self, regs: &mut GeneralRegisters) -> InsnResult;

    /// # Safety
    ///
    /// The core must be in VMX root operation.
    unsafe fn invept(&mut self, kind: InvEptType, descriptor: &[u64; 2]) -> InsnResult;

    /// # Safety
    ///
    /// The core must be in VMX root operation.
    unsafe fn invvpid(&mut self, kind: InvVpidType, descriptor: &[u64; 2]) -> InsnResult;

    /// Write the host-state area of the current VMCS from the running processor.
    ///
    /// # Safety
    ///
    /// A current VMCS must be loaded.
    unsafe fn write_host_state(&mut self) -> InsnResult;

    /// A monotonic timestamp (the time-stamp counter on real hardware).
    fn timestamp(&self) -> u64;
}
