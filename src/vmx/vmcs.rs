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

#![allow(non_camel_case_types)]

use super::definitions::{VmxInstructionError, VmxRawExitReason};
use crate::VmxPlatform;

/// A VMCS field that can be read with `VMREAD`.
pub trait VmcsReadable: Copy {
    type Value;

    /// The 32-bit field encoding. (SDM Vol. 3D, Appendix B)
    fn encoding(self) -> u32;

    fn decode(raw: u64) -> Self::Value;
}

/// A VMCS field that can be written with `VMWRITE`.
///
/// Host-state fields are deliberately not writable: they are owned by the VMCS load path.
pub trait VmcsWritable: VmcsReadable {
    fn encode(value: Self::Value) -> u64;
}

macro_rules! vmcs_read {
    ($field_type:ident, $ty:ty) => {
        impl VmcsReadable for $field_type {
            type Value = $ty;

            fn encoding(self) -> u32 {
                self as u32
            }

            fn decode(raw: u64) -> $ty {
                raw as $ty
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_type:ident, $ty:ty) => {
        impl VmcsWritable for $field_type {
            fn encode(value: $ty) -> u64 {
                value as u64
            }
        }
    };
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
pub enum VmcsControl16 {
    /// Virtual-processor identifier (VPID).
    VPID = 0x0,
    /// Posted-interrupt notification vector.
    POSTED_INTERRUPT_NOTIFICATION_VECTOR = 0x2,
    /// EPTP index.
    EPTP_INDEX = 0x4,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
pub enum VmcsControl64 {
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    VMENTRY_MSR_LOAD_ADDR = 0x200A,
    TSC_OFFSET = 0x2010,
    VM_FUNCTION_CONTROLS = 0x2018,
    /// Extended-page-table pointer (EPTP).
    EPTP = 0x201A,
    EPTP_LIST_ADDR = 0x2024,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400A,
    VMEXIT_CONTROLS = 0x400C,
    VMEXIT_MSR_STORE_COUNT = 0x400E,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    VMENTRY_INSTRUCTION_LEN = 0x401A,
    TPR_THRESHOLD = 0x401C,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401E,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.2.2)
pub enum VmcsReadOnly64 {
    GUEST_PHYSICAL_ADDR = 0x2400,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    IDT_VECTORING_INFO = 0x4408,
    IDT_VECTORING_ERR_CODE = 0x440A,
    VMEXIT_INSTRUCTION_LEN = 0x440C,
    VMEXIT_INSTRUCTION_INFO = 0x440E,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
pub enum VmcsReadOnlyNW {
    EXIT_QUALIFICATION = 0x6400,
    IO_RCX = 0x6402,
    IO_RSI = 0x6404,
    IO_RDI = 0x6406,
    IO_RIP = 0x6408,
    GUEST_LINEAR_ADDR = 0x640A,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
    INTERRUPT_STATUS = 0x810,
    PML_INDEX = 0x812,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
pub enum VmcsGuest64 {
    /// Must be all ones unless VMCS shadowing is used.
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
    IA32_PERF_GLOBAL_CTRL = 0x2808,
    PDPTE0 = 0x280a,
    PDPTE1 = 0x280c,
    PDPTE2 = 0x280e,
    PDPTE3 = 0x2810,
    IA32_BNDCFGS = 0x2812,
    IA32_RTIT_CTL = 0x2814,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480a,
    LDTR_LIMIT = 0x480c,
    TR_LIMIT = 0x480e,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481a,
    FS_ACCESS_RIGHTS = 0x481c,
    GS_ACCESS_RIGHTS = 0x481e,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    SMBASE = 0x4828,
    IA32_SYSENTER_CS = 0x482a,
    VMX_PREEMPTION_TIMER_VALUE = 0x482e,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680A,
    DS_BASE = 0x680C,
    FS_BASE = 0x680E,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681A,
    RSP = 0x681C,
    RIP = 0x681E,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
pub enum VmcsHost16 {
    ES_SELECTOR = 0xc00,
    CS_SELECTOR = 0xc02,
    SS_SELECTOR = 0xc04,
    DS_SELECTOR = 0xc06,
    FS_SELECTOR = 0xc08,
    GS_SELECTOR = 0xc0a,
    TR_SELECTOR = 0xc0c,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
pub enum VmcsHost64 {
    IA32_PAT = 0x2c00,
    IA32_EFER = 0x2c02,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4c00,
}
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
pub enum VmcsHostNW {
    CR0 = 0x6c00,
    CR3 = 0x6c02,
    CR4 = 0x6c04,
    FS_BASE = 0x6c06,
    GS_BASE = 0x6c08,
    TR_BASE = 0x6c0a,
    GDTR_BASE = 0x6c0c,
    IDTR_BASE = 0x6c0e,
    IA32_SYSENTER_ESP = 0x6c10,
    IA32_SYSENTER_EIP = 0x6c12,
    RSP = 0x6c14,
    RIP = 0x6c16,
}
}

vmcs_read!(VmcsControl16, u16);
vmcs_read!(VmcsControl32, u32);
vmcs_read!(VmcsControl64, u64);
vmcs_read!(VmcsReadOnly32, u32);
vmcs_read!(VmcsReadOnly64, u64);
vmcs_read!(VmcsReadOnlyNW, u64);
vmcs_read!(VmcsGuest16, u16);
vmcs_read!(VmcsGuest32, u32);
vmcs_read!(VmcsGuest64, u64);
vmcs_read!(VmcsGuestNW, u64);
vmcs_read!(VmcsHost16, u16);
vmcs_read!(VmcsHost32, u32);
vmcs_read!(VmcsHost64, u64);
vmcs_read!(VmcsHostNW, u64);

vmcs_write!(VmcsControl16, u16);
vmcs_write!(VmcsControl32, u32);
vmcs_write!(VmcsControl64, u64);
vmcs_write!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest32, u32);
vmcs_write!(VmcsGuest64, u64);
vmcs_write!(VmcsGuestNW, u64);

/// The VM-instruction error field of the current VMCS.
///
/// Only meaningful right after a `VMfailValid`.
pub(crate) fn instruction_error<P: VmxPlatform>(platform: &P) -> VmxInstructionError {
    platform
        .vmread(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32)
        .map(|v| VmxInstructionError::from(v as u32))
        .unwrap_or(VmxInstructionError::from(0))
}

pub(crate) fn exit_reason<P: VmxPlatform>(platform: &P) -> x86::vmx::Result<VmxRawExitReason> {
    platform
        .vmread(VmcsReadOnly32::EXIT_REASON as u32)
        .map(|v| VmxRawExitReason(v as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_encodings() {
        assert_eq!(VmcsControl16::VPID.encoding(), 0x0);
        assert_eq!(VmcsControl64::EPTP.encoding(), 0x201a);
        assert_eq!(VmcsReadOnly32::EXIT_REASON.encoding(), 0x4402);
        assert_eq!(VmcsReadOnlyNW::EXIT_QUALIFICATION.encoding(), 0x6400);
        assert_eq!(VmcsHostNW::RSP.encoding(), 0x6c14);
        assert_eq!(VmcsHostNW::RIP.encoding(), 0x6c16);
        assert_eq!(VmcsGuest16::TR_SELECTOR.encoding(), 0x80e);
        assert_eq!(VmcsGuest32::ACTIVITY_STATE.encoding(), 0x4826);
        assert_eq!(VmcsGuest64::LINK_PTR.encoding(), 0x2800);
    }

    #[test]
    fn test_guest_fields_are_not_read_only() {
        // Bits 11:10 of an encoding give the field type; 1 marks read-only data.
        let kind = |encoding: u32| (encoding >> 10) & 0b11;
        assert_eq!(kind(VmcsGuest16::CS_SELECTOR.encoding()), 2);
        assert_eq!(kind(VmcsGuest32::CS_ACCESS_RIGHTS.encoding()), 2);
        assert_eq!(kind(VmcsGuest64::IA32_EFER.encoding()), 2);
        assert_eq!(kind(VmcsReadOnly32::EXIT_REASON.encoding()), 1);
    }

    #[test]
    fn test_decode_truncates_to_field_width() {
        assert_eq!(VmcsControl16::decode(0x1_2345), 0x2345_u16);
        assert_eq!(VmcsReadOnly32::decode(0xffff_ffff_8000_000c), 0x8000_000c_u32);
        assert_eq!(VmcsGuestNW::encode(0xffff_8000_0000_0000), 0xffff_8000_0000_0000);
    }
}
