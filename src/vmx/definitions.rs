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

use core::fmt;

/// VM-instruction error numbers. (SDM Vol. 3C, Section 31.4)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmxInstructionError(u32);

impl VmxInstructionError {
    pub const VMCALL_IN_ROOT: Self = Self(1);
    pub const VMCLEAR_INVALID_ADDRESS: Self = Self(2);
    pub const VMCLEAR_VMXON_POINTER: Self = Self(3);
    pub const VMLAUNCH_NON_CLEAR_VMCS: Self = Self(4);
    pub const VMRESUME_NON_LAUNCHED_VMCS: Self = Self(5);
    pub const VMRESUME_AFTER_VMXOFF: Self = Self(6);
    pub const ENTRY_INVALID_CONTROL_FIELD: Self = Self(7);
    pub const ENTRY_INVALID_HOST_STATE_FIELD: Self = Self(8);
    pub const VMPTRLD_INVALID_ADDRESS: Self = Self(9);
    pub const VMPTRLD_VMXON_POINTER: Self = Self(10);
    pub const VMPTRLD_INCORRECT_REVISION: Self = Self(11);
    pub const UNSUPPORTED_COMPONENT: Self = Self(12);
    pub const VMWRITE_READ_ONLY_COMPONENT: Self = Self(13);
    pub const VMXON_IN_ROOT: Self = Self(15);
    pub const INVALID_INVEPT_INVVPID_OPERAND: Self = Self(28);

    /// The raw error number.
    pub const fn code(&self) -> u32 {
        self.0
    }

    pub fn as_str(&self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            3 => "VMCLEAR with VMXON pointer",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            6 => "VMRESUME after VMXOFF (VMXOFF and VMXON between VMLAUNCH and VMRESUME)",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            10 => "VMPTRLD with VMXON pointer",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            15 => "VMXON executed in VMX root operation",
            16 => "VM entry with invalid executive-VMCS pointer",
            17 => "VM entry with non-launched executive VMCS",
            18 => "VM entry with executive-VMCS pointer not VMXON pointer",
            19 => "VMCALL with non-clear VMCS",
            20 => "VMCALL with invalid VM-exit control fields",
            22 => "VMCALL with incorrect MSEG revision identifier",
            23 => "VMXOFF under dual-monitor treatment of SMIs and SMM",
            24 => "VMCALL with invalid SMM-monitor features",
            25 => "VM entry with invalid VM-execution control fields in executive VMCS",
            26 => "VM entry with events blocked by MOV SS",
            28 => "Invalid operand to INVEPT/INVVPID",
            _ => "[INVALID]",
        }
    }
}

impl From<u32> for VmxInstructionError {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for VmxInstructionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for VmxInstructionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VmxInstructionError({}, {:?})", self.0, self.as_str())
    }
}

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// Basic VM-exit reasons. (SDM Vol. 3D, Appendix C)
pub enum VmxExitReason {
    EXCEPTION_NMI = 0,
    EXTERNAL_INTERRUPT = 1,
    TRIPLE_FAULT = 2,
    INIT = 3,
    SIPI = 4,
    SMI = 5,
    OTHER_SMI = 6,
    INTERRUPT_WINDOW = 7,
    NMI_WINDOW = 8,
    TASK_SWITCH = 9,
    CPUID = 10,
    GETSEC = 11,
    HLT = 12,
    INVD = 13,
    INVLPG = 14,
    RDPMC = 15,
    RDTSC = 16,
    RSM = 17,
    VMCALL = 18,
    VMCLEAR = 19,
    VMLAUNCH = 20,
    VMPTRLD = 21,
    VMPTRST = 22,
    VMREAD = 23,
    VMRESUME = 24,
    VMWRITE = 25,
    VMOFF = 26,
    VMON = 27,
    CR_ACCESS = 28,
    DR_ACCESS = 29,
    IO_INSTRUCTION = 30,
    MSR_READ = 31,
    MSR_WRITE = 32,
    INVALID_GUEST_STATE = 33,
    MSR_LOAD_FAIL = 34,
    MWAIT_INSTRUCTION = 36,
    MONITOR_TRAP_FLAG = 37,
    MONITOR_INSTRUCTION = 39,
    PAUSE_INSTRUCTION = 40,
    MCE_DURING_VMENTRY = 41,
    TPR_BELOW_THRESHOLD = 43,
    APIC_ACCESS = 44,
    VIRTUALIZED_EOI = 45,
    GDTR_IDTR = 46,
    LDTR_TR = 47,
    EPT_VIOLATION = 48,
    EPT_MISCONFIG = 49,
    INVEPT = 50,
    RDTSCP = 51,
    PREEMPTION_TIMER = 52,
    INVVPID = 53,
    WBINVD = 54,
    XSETBV = 55,
    APIC_WRITE = 56,
    RDRAND = 57,
    INVPCID = 58,
    VMFUNC = 59,
    ENCLS = 60,
    RDSEED = 61,
    PML_FULL = 62,
    XSAVES = 63,
    XRSTORS = 64,
    SPP_EVENT = 66,
    UMWAIT = 67,
    TPAUSE = 68,
    LOADIWKEY = 69,
}
}

/// The raw 32-bit exit-reason field. (SDM Vol. 3C, Section 25.9.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxRawExitReason(pub u32);

impl VmxRawExitReason {
    /// Bit 31: the exit was caused by a failed VM entry.
    pub const ENTRY_FAILURE: u32 = 1 << 31;

    /// Bits 15:0.
    pub const fn basic(&self) -> u16 {
        self.0 as u16
    }

    pub const fn entry_failure(&self) -> bool {
        self.0 & Self::ENTRY_FAILURE != 0
    }

    /// The decoded basic reason, if it is one this crate knows.
    pub fn reason(&self) -> Option<VmxExitReason> {
        VmxExitReason::try_from(self.basic() as u32).ok()
    }
}
