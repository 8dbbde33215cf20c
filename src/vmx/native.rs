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

use bit_field::BitField;
use raw_cpuid::CpuId;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::SegmentSelector;
use x86_64::registers::control::{Cr0, Cr3, Cr4};

use super::instructions::{self, capture_status, InvEptType, InvVpidType};
use super::vmcs::{VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW};
use crate::platform::InsnResult;
use crate::{GeneralRegisters, HostPhysAddr, Msr, VmxPlatform};

/// The processor this code is running on.
#[derive(Debug, Default, Clone, Copy)]
pub struct X86Platform;

impl X86Platform {
    unsafe fn enter(regs: &mut GeneralRegisters, resume: bool) -> InsnResult {
        match unsafe { instructions::vmx_enter(regs, resume as u64) } {
            0 => Ok(()),
            1 => capture_status(true, false),
            _ => capture_status(false, true),
        }
    }
}

macro_rules! host_write {
    ($field:expr, $value:expr) => {
        unsafe { instructions::vmwrite($field as u32, $value as u64) }?
    };
}

impl VmxPlatform for X86Platform {
    fn vmx_present(&self) -> bool {
        CpuId::new()
            .get_feature_info()
            .is_some_and(|feature| feature.has_vmx())
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        msr.read()
    }

    unsafe fn write_msr(&mut self, msr: Msr, value: u64) {
        unsafe { msr.write(value) }
    }

    fn read_cr0(&self) -> u64 {
        Cr0::read_raw()
    }

    fn read_cr4(&self) -> u64 {
        Cr4::read_raw()
    }

    unsafe fn write_cr4(&mut self, value: u64) {
        unsafe { Cr4::write_raw(value) }
    }

    unsafe fn vmxon(&mut self, paddr: HostPhysAddr) -> InsnResult {
        unsafe { instructions::vmxon(paddr.as_usize() as u64) }
    }

    unsafe fn vmxoff(&mut self) -> InsnResult {
        unsafe { instructions::vmxoff() }
    }

    unsafe fn vmptrld(&mut self, paddr: HostPhysAddr) -> InsnResult {
        unsafe { instructions::vmptrld(paddr.as_usize() as u64) }
    }

    unsafe fn vmclear(&mut self, paddr: HostPhysAddr) -> InsnResult {
        unsafe { instructions::vmclear(paddr.as_usize() as u64) }
    }

    fn vmread(&self, field: u32) -> x86::vmx::Result<u64> {
        instructions::vmread(field)
    }

    unsafe fn vmwrite(&mut self, field: u32, value: u64) -> InsnResult {
        unsafe { instructions::vmwrite(field, value) }
    }

    unsafe fn vmlaunch(&mut self, regs: &mut GeneralRegisters) -> InsnResult {
        unsafe { Self::enter(regs, false) }
    }

    unsafe fn vmresume(&mut self, regs: &mut GeneralRegisters) -> InsnResult {
        unsafe { Self::enter(regs, true) }
    }

    unsafe fn invept(&mut self, kind: InvEptType, descriptor: &[u64; 2]) -> InsnResult {
        unsafe { instructions::invept(kind, descriptor) }
    }

    unsafe fn invvpid(&mut self, kind: InvVpidType, descriptor: &[u64; 2]) -> InsnResult {
        unsafe { instructions::invvpid(kind, descriptor) }
    }

    unsafe fn write_host_state(&mut self) -> InsnResult {
        host_write!(VmcsHost64::IA32_PAT, Msr::IA32_PAT.read());
        host_write!(VmcsHost64::IA32_EFER, Msr::IA32_EFER.read());

        host_write!(VmcsHostNW::CR0, Cr0::read_raw());
        host_write!(VmcsHostNW::CR3, Cr3::read_raw().0.start_address().as_u64());
        host_write!(VmcsHostNW::CR4, Cr4::read_raw());

        host_write!(VmcsHost16::ES_SELECTOR, x86::segmentation::es().bits());
        host_write!(VmcsHost16::CS_SELECTOR, x86::segmentation::cs().bits());
        host_write!(VmcsHost16::SS_SELECTOR, x86::segmentation::ss().bits());
        host_write!(VmcsHost16::DS_SELECTOR, x86::segmentation::ds().bits());
        host_write!(VmcsHost16::FS_SELECTOR, x86::segmentation::fs().bits());
        host_write!(VmcsHost16::GS_SELECTOR, x86::segmentation::gs().bits());
        host_write!(VmcsHostNW::FS_BASE, Msr::IA32_FS_BASE.read());
        host_write!(VmcsHostNW::GS_BASE, Msr::IA32_GS_BASE.read());

        let tr = unsafe { x86::task::tr() };
        let mut gdtp = DescriptorTablePointer::<u64>::default();
        let mut idtp = DescriptorTablePointer::<u64>::default();
        unsafe {
            dtables::sgdt(&mut gdtp);
            dtables::sidt(&mut idtp);
        }
        let tr_base = unsafe { get_tr_base(tr, &gdtp) };
        host_write!(VmcsHost16::TR_SELECTOR, tr.bits());
        host_write!(VmcsHostNW::TR_BASE, tr_base);
        host_write!(VmcsHostNW::GDTR_BASE, gdtp.base as u64);
        host_write!(VmcsHostNW::IDTR_BASE, idtp.base as u64);
        host_write!(VmcsHostNW::RIP, instructions::vmx_exit as *const () as usize);

        host_write!(VmcsHostNW::IA32_SYSENTER_ESP, 0);
        host_write!(VmcsHostNW::IA32_SYSENTER_EIP, 0);
        host_write!(VmcsHost32::IA32_SYSENTER_CS, 0);
        Ok(())
    }

    fn timestamp(&self) -> u64 {
        unsafe { x86::time::rdtsc() }
    }
}

/// Base address of the TSS selected by `tr`, read from its 16-byte GDT descriptor.
///
/// # Safety
///
/// `gdt` must describe the live GDT.
unsafe fn get_tr_base(tr: SegmentSelector, gdt: &DescriptorTablePointer<u64>) -> u64 {
    let index = tr.index() as usize;
    let table_len = (gdt.limit as usize + 1) / core::mem::size_of::<u64>();
    let table = unsafe { core::slice::from_raw_parts(gdt.base, table_len) };
    let entry = table[index];
    if entry.get_bit(47) {
        // present
        let base_low = entry.get_bits(16..40) | entry.get_bits(56..64) << 24;
        let base_high = table[index + 1] & 0xffff_ffff;
        base_low | base_high << 32
    } else {
        // no present
        0
    }
}
