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
use bitflags::bitflags;

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// Revision identifier of VMXON and VMCS regions.
    pub revision_id: u32,
    /// Number of bytes to allocate for VMXON and VMCS regions.
    pub region_size: u16,
    /// Whether region addresses are limited to 32 bits.
    pub is_32bit_address: bool,
    /// Memory type used to access VMCS and related structures.
    pub mem_type: u8,
    /// Whether INS/OUTS exits report instruction information.
    pub io_exit_info: bool,
    /// Whether the `IA32_VMX_TRUE_*_CTLS` registers exist.
    pub true_controls: bool,
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    pub fn from_raw(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            true_controls: msr.get_bit(55),
        }
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. when clear,
       /// VMXON causes a #GP.
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
    }
}

bitflags! {
    /// Primary processor-based VM-execution controls we look at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrimaryControls: u32 {
        /// Determines whether the secondary processor-based controls are used.
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based VM-execution controls we look at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecondaryControls: u32 {
        const ENABLE_EPT = 1 << 1;
        const ENABLE_VPID = 1 << 5;
        const UNRESTRICTED_GUEST = 1 << 7;
        const ENABLE_VM_FUNCTIONS = 1 << 13;
    }
}

bitflags! {
    /// IA32_VMX_EPT_VPID_CAP. (SDM Vol. 3D, Appendix A.10)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptVpidCaps: u64 {
        const EXECUTE_ONLY = 1 << 0;
        const PAGE_WALK_4 = 1 << 6;
        const MEMORY_TYPE_UC = 1 << 8;
        const MEMORY_TYPE_WB = 1 << 14;
        const PAGE_2M = 1 << 16;
        const PAGE_1G = 1 << 17;
        const INVEPT = 1 << 20;
        const ACCESSED_DIRTY = 1 << 21;
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        const INVEPT_ALL_CONTEXTS = 1 << 26;
        const INVVPID = 1 << 32;
        const INVVPID_INDIVIDUAL_ADDRESS = 1 << 40;
        const INVVPID_SINGLE_CONTEXT = 1 << 41;
        const INVVPID_ALL_CONTEXTS = 1 << 42;
        const INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS = 1 << 43;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmx_basic_fields() {
        // Revision 0x12, 1 KiB regions, write-back, I/O exit info and true controls.
        let basic = VmxBasic::from_raw(0x00da_0400_0000_0012);
        assert_eq!(basic.revision_id, 0x12);
        assert_eq!(basic.region_size, 0x400);
        assert_eq!(basic.mem_type, VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK);
        assert!(!basic.is_32bit_address);
        assert!(basic.io_exit_info);
        assert!(basic.true_controls);

        let legacy = VmxBasic::from_raw(0x0058_0400_0000_0012);
        assert!(!legacy.true_controls);
    }

    #[test]
    fn test_revision_ignores_bit_31() {
        let basic = VmxBasic::from_raw(0x8000_0001);
        assert_eq!(basic.revision_id, 1);
    }
}
