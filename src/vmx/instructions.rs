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

//! Intel VMX instruction wrappers.
//!
//! Every VMX instruction reports its outcome in RFLAGS (SDM Vol. 3C, Section 31.2):
//! `CF = 1` is `VMfailInvalid`, `ZF = 1` is `VMfailValid`, both clear is success.

use x86::vmx::{Result, VmFail};

/// INVEPT invalidation types. (SDM Vol. 3C, Section 31.3)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvEptType {
    /// Invalidate mappings associated with one EPTP.
    SingleContext = 1,
    /// Invalidate mappings associated with all EPTPs.
    AllContexts = 2,
}

/// INVVPID invalidation types. (SDM Vol. 3C, Section 31.3)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvVpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainingGlobals = 3,
}

/// Decode the two status flags, carry first.
#[inline(always)]
pub(crate) fn capture_status(cf: bool, zf: bool) -> Result<()> {
    if cf {
        Err(VmFail::VmFailInvalid)
    } else if zf {
        Err(VmFail::VmFailValid)
    } else {
        Ok(())
    }
}

cfg_if::cfg_if! {
if #[cfg(target_arch = "x86_64")] {

use core::arch::{asm, naked_asm};
use core::mem::offset_of;

use crate::GeneralRegisters;

/// Run one instruction taking a 64-bit physical address in memory and decode its flags.
macro_rules! vmx_addr_insn {
    ($name:ident, $insn:literal) => {
        #[inline(always)]
        pub(crate) unsafe fn $name(paddr: u64) -> Result<()> {
            let (cf, zf): (u8, u8);
            unsafe {
                asm!(
                    concat!($insn, " [{addr}]"),
                    "setc {cf}",
                    "setz {zf}",
                    addr = in(reg) &paddr,
                    cf = out(reg_byte) cf,
                    zf = out(reg_byte) zf,
                    options(nostack),
                );
            }
            capture_status(cf != 0, zf != 0)
        }
    };
}

vmx_addr_insn!(vmxon, "vmxon");
vmx_addr_insn!(vmptrld, "vmptrld");
vmx_addr_insn!(vmclear, "vmclear");

#[inline(always)]
pub(crate) unsafe fn vmxoff() -> Result<()> {
    let (cf, zf): (u8, u8);
    unsafe {
        asm!(
            "vmxoff",
            "setc {cf}",
            "setz {zf}",
            cf = out(reg_byte) cf,
            zf = out(reg_byte) zf,
            options(nostack),
        );
    }
    capture_status(cf != 0, zf != 0)
}

#[inline(always)]
pub(crate) fn vmread(field: u32) -> Result<u64> {
    let value: u64;
    let (cf, zf): (u8, u8);
    // VMREAD has no side effect beyond its destination register.
    unsafe {
        asm!(
            "vmread {value}, {field}",
            "setc {cf}",
            "setz {zf}",
            field = in(reg) field as u64,
            value = out(reg) value,
            cf = out(reg_byte) cf,
            zf = out(reg_byte) zf,
            options(nostack),
        );
    }
    capture_status(cf != 0, zf != 0).map(|_| value)
}

#[inline(always)]
pub(crate) unsafe fn vmwrite(field: u32, value: u64) -> Result<()> {
    let (cf, zf): (u8, u8);
    unsafe {
        asm!(
            "vmwrite {field}, {value}",
            "setc {cf}",
            "setz {zf}",
            field = in(reg) field as u64,
            value = in(reg) value,
            cf = out(reg_byte) cf,
            zf = out(reg_byte) zf,
            options(nostack),
        );
    }
    capture_status(cf != 0, zf != 0)
}

#[inline(always)]
pub(crate) unsafe fn invept(kind: InvEptType, descriptor: &[u64; 2]) -> Result<()> {
    let (cf, zf): (u8, u8);
    unsafe {
        asm!(
            "invept {kind}, [{desc}]",
            "setc {cf}",
            "setz {zf}",
            kind = in(reg) kind as u64,
            desc = in(reg) descriptor.as_ptr(),
            cf = out(reg_byte) cf,
            zf = out(reg_byte) zf,
            options(nostack),
        );
    }
    capture_status(cf != 0, zf != 0)
}

#[inline(always)]
pub(crate) unsafe fn invvpid(kind: InvVpidType, descriptor: &[u64; 2]) -> Result<()> {
    let (cf, zf): (u8, u8);
    unsafe {
        asm!(
            "invvpid {kind}, [{desc}]",
            "setc {cf}",
            "setz {zf}",
            kind = in(reg) kind as u64,
            desc = in(reg) descriptor.as_ptr(),
            cf = out(reg_byte) cf,
            zf = out(reg_byte) zf,
            options(nostack),
        );
    }
    capture_status(cf != 0, zf != 0)
}

/// Enter the guest with `vmlaunch` (`resume == 0`) or `vmresume`.
///
/// Host callee-saved registers and `regs` are pushed, `HOST_RSP` is pointed at them, then
/// the guest registers are loaded from `regs`. A failed entry falls through and returns
/// 1 (`CF`) or 2 (`ZF`); a VM exit lands in [`vmx_exit`] which stores the guest registers
/// back into `regs` and returns 0 to our caller.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn vmx_enter(regs: *mut GeneralRegisters, resume: u64) -> u64 {
    naked_asm!(
        "push   rbp",
        "push   rbx",
        "push   r12",
        "push   r13",
        "push   r14",
        "push   r15",
        "push   rdi",
        "mov    rax, {host_rsp}",
        "vmwrite rax, rsp",
        "jbe    3f",
        "test   rsi, rsi",
        "mov    rax, [rdi + {rax}]",
        "mov    rcx, [rdi + {rcx}]",
        "mov    rdx, [rdi + {rdx}]",
        "mov    rbx, [rdi + {rbx}]",
        "mov    rbp, [rdi + {rbp}]",
        "mov    rsi, [rdi + {rsi}]",
        "mov    r8,  [rdi + {r8}]",
        "mov    r9,  [rdi + {r9}]",
        "mov    r10, [rdi + {r10}]",
        "mov    r11, [rdi + {r11}]",
        "mov    r12, [rdi + {r12}]",
        "mov    r13, [rdi + {r13}]",
        "mov    r14, [rdi + {r14}]",
        "mov    r15, [rdi + {r15}]",
        "mov    rdi, [rdi + {rdi}]",
        "jnz    2f",
        "vmlaunch",
        "jmp    3f",
        "2:",
        "vmresume",
        "3:",
        "mov    eax, 1",
        "jc     4f",
        "mov    eax, 2",
        "4:",
        "add    rsp, 8",
        "pop    r15",
        "pop    r14",
        "pop    r13",
        "pop    r12",
        "pop    rbx",
        "pop    rbp",
        "ret",
        host_rsp = const super::vmcs::VmcsHostNW::RSP as u32,
        rax = const offset_of!(GeneralRegisters, rax),
        rcx = const offset_of!(GeneralRegisters, rcx),
        rdx = const offset_of!(GeneralRegisters, rdx),
        rbx = const offset_of!(GeneralRegisters, rbx),
        rbp = const offset_of!(GeneralRegisters, rbp),
        rsi = const offset_of!(GeneralRegisters, rsi),
        rdi = const offset_of!(GeneralRegisters, rdi),
        r8 = const offset_of!(GeneralRegisters, r8),
        r9 = const offset_of!(GeneralRegisters, r9),
        r10 = const offset_of!(GeneralRegisters, r10),
        r11 = const offset_of!(GeneralRegisters, r11),
        r12 = const offset_of!(GeneralRegisters, r12),
        r13 = const offset_of!(GeneralRegisters, r13),
        r14 = const offset_of!(GeneralRegisters, r14),
        r15 = const offset_of!(GeneralRegisters, r15),
    )
}

/// `HOST_RIP` of every VMCS loaded by this crate.
///
/// Entered with `RSP == HOST_RSP`, whose top holds the `regs` pointer pushed by
/// [`vmx_enter`]. Never called directly.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn vmx_exit() -> u64 {
    naked_asm!(
        "push   rdi",
        "mov    rdi, [rsp + 8]",
        "mov    [rdi + {rax}], rax",
        "mov    [rdi + {rcx}], rcx",
        "mov    [rdi + {rdx}], rdx",
        "mov    [rdi + {rbx}], rbx",
        "mov    [rdi + {rbp}], rbp",
        "mov    [rdi + {rsi}], rsi",
        "mov    [rdi + {r8}],  r8",
        "mov    [rdi + {r9}],  r9",
        "mov    [rdi + {r10}], r10",
        "mov    [rdi + {r11}], r11",
        "mov    [rdi + {r12}], r12",
        "mov    [rdi + {r13}], r13",
        "mov    [rdi + {r14}], r14",
        "mov    [rdi + {r15}], r15",
        "pop    rax",
        "mov    [rdi + {rdi}], rax",
        "add    rsp, 8",
        "pop    r15",
        "pop    r14",
        "pop    r13",
        "pop    r12",
        "pop    rbx",
        "pop    rbp",
        "xor    eax, eax",
        "ret",
        rax = const offset_of!(GeneralRegisters, rax),
        rcx = const offset_of!(GeneralRegisters, rcx),
        rdx = const offset_of!(GeneralRegisters, rdx),
        rbx = const offset_of!(GeneralRegisters, rbx),
        rbp = const offset_of!(GeneralRegisters, rbp),
        rsi = const offset_of!(GeneralRegisters, rsi),
        rdi = const offset_of!(GeneralRegisters, rdi),
        r8 = const offset_of!(GeneralRegisters, r8),
        r9 = const offset_of!(GeneralRegisters, r9),
        r10 = const offset_of!(GeneralRegisters, r10),
        r11 = const offset_of!(GeneralRegisters, r11),
        r12 = const offset_of!(GeneralRegisters, r12),
        r13 = const offset_of!(GeneralRegisters, r13),
        r14 = const offset_of!(GeneralRegisters, r14),
        r15 = const offset_of!(GeneralRegisters, r15),
    )
}

}
}
