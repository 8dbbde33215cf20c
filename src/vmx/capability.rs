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

use spin::Once;

use super::instructions::{InvEptType, InvVpidType};
use super::structs::{EptVpidCaps, PrimaryControls, SecondaryControls, VmxBasic};
use crate::{Msr, Result, VmxError, VmxPlatform};

/// The five VM-execution, VM-exit and VM-entry control groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlGroup {
    PinBased,
    PrimaryProcessor,
    SecondaryProcessor,
    Exit,
    Entry,
}

/// Which bits of a control group the processor fixes. (SDM Vol. 3D, Appendix A.3)
///
/// A capability MSR reports the allowed 0-settings in its low half (a 1 there means the
/// control must be 1) and the allowed 1-settings in its high half (a 0 there means the
/// control must be 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlDefaults {
    pub group: ControlGroup,
    pub must_be_0: u32,
    pub must_be_1: u32,
}

impl ControlDefaults {
    pub fn from_msr(group: ControlGroup, raw: u64) -> Self {
        Self {
            group,
            must_be_0: !((raw >> 32) as u32),
            must_be_1: raw as u32,
        }
    }

    /// Defaults of a group the processor does not implement: nothing may be set.
    pub const fn absent(group: ControlGroup) -> Self {
        Self {
            group,
            must_be_0: u32::MAX,
            must_be_1: 0,
        }
    }

    /// Bits that software may set to 1.
    pub const fn allowed_1(&self) -> u32 {
        !self.must_be_0
    }

    pub const fn allows(&self, bits: u32) -> bool {
        bits & self.must_be_0 == 0
    }

    /// Merge the mandatory bits into `requested`.
    ///
    /// Fails with [`VmxError::ControlNotAllowed`] naming the bits the processor forces to 0.
    pub fn adjust(&self, requested: u32) -> Result<u32> {
        let rejected = requested & self.must_be_0;
        if rejected != 0 {
            return Err(VmxError::ControlNotAllowed {
                group: self.group,
                bits: rejected,
            });
        }
        Ok(requested | self.must_be_1)
    }
}

/// Fixed bits of a control register in VMX operation. (SDM Vol. 3D, Appendix A.7, A.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedBits {
    pub must_be_0: u64,
    pub must_be_1: u64,
}

impl FixedBits {
    /// `fixed0` reports bits fixed to 1, `fixed1` reports (as zeros) bits fixed to 0.
    pub const fn from_msrs(fixed0: u64, fixed1: u64) -> Self {
        Self {
            must_be_0: !fixed1,
            must_be_1: fixed0,
        }
    }

    pub const fn admits(&self, value: u64) -> bool {
        value & self.must_be_1 == self.must_be_1 && value & self.must_be_0 == 0
    }

    /// Force `value` into the admitted range.
    pub const fn apply(&self, value: u64) -> u64 {
        (value | self.must_be_1) & !self.must_be_0
    }
}

/// EPT and VPID support together with the invalidation granularities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsolationCapabilities {
    pub ept: bool,
    pub vpid: bool,
    pub flags: EptVpidCaps,
}

impl IsolationCapabilities {
    pub fn supports_invept(&self, kind: InvEptType) -> bool {
        let granularity = match kind {
            InvEptType::SingleContext => EptVpidCaps::INVEPT_SINGLE_CONTEXT,
            InvEptType::AllContexts => EptVpidCaps::INVEPT_ALL_CONTEXTS,
        };
        self.ept && self.flags.contains(EptVpidCaps::INVEPT | granularity)
    }

    pub fn supports_invvpid(&self, kind: InvVpidType) -> bool {
        let granularity = match kind {
            InvVpidType::IndividualAddress => EptVpidCaps::INVVPID_INDIVIDUAL_ADDRESS,
            InvVpidType::SingleContext => EptVpidCaps::INVVPID_SINGLE_CONTEXT,
            InvVpidType::AllContexts => EptVpidCaps::INVVPID_ALL_CONTEXTS,
            InvVpidType::SingleContextRetainingGlobals => {
                EptVpidCaps::INVVPID_SINGLE_CONTEXT_RETAINING_GLOBALS
            }
        };
        self.vpid && self.flags.contains(EptVpidCaps::INVVPID | granularity)
    }
}

/// What the current processor supports, frozen at detection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub supported: bool,
    pub basic: VmxBasic,
    pub pin_based: ControlDefaults,
    pub primary_processor: ControlDefaults,
    pub secondary_processor: ControlDefaults,
    pub exit: ControlDefaults,
    pub entry: ControlDefaults,
    pub cr0_fixed: FixedBits,
    pub cr4_fixed: FixedBits,
    pub isolation: IsolationCapabilities,
    pub unrestricted_guest: bool,
    /// `IA32_VMX_VMFUNC` when VM functions can be enabled.
    pub vm_functions: Option<u64>,
}

macro_rules! read_fixed_bits {
    ($platform:expr, $cr:ident) => {
        paste::paste! {
            FixedBits::from_msrs(
                $platform.read_msr(Msr::[<IA32_VMX_ $cr _FIXED0>]),
                $platform.read_msr(Msr::[<IA32_VMX_ $cr _FIXED1>]),
            )
        }
    };
}

impl CapabilitySnapshot {
    /// Read the capability MSRs of the processor.
    ///
    /// No VMX capability MSR is read unless CPUID reports VMX: those reads fault otherwise.
    pub fn detect<P: VmxPlatform>(platform: &P) -> Result<Self> {
        if !platform.vmx_present() {
            warn!("[VMX] CPUID reports no VMX support");
            return Err(VmxError::Unsupported("VMX"));
        }

        let basic = VmxBasic::from_raw(platform.read_msr(Msr::IA32_VMX_BASIC));

        let (pin_msr, proc_msr, exit_msr, entry_msr) = if basic.true_controls {
            (
                Msr::IA32_VMX_TRUE_PINBASED_CTLS,
                Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
                Msr::IA32_VMX_TRUE_EXIT_CTLS,
                Msr::IA32_VMX_TRUE_ENTRY_CTLS,
            )
        } else {
            (
                Msr::IA32_VMX_PINBASED_CTLS,
                Msr::IA32_VMX_PROCBASED_CTLS,
                Msr::IA32_VMX_EXIT_CTLS,
                Msr::IA32_VMX_ENTRY_CTLS,
            )
        };
        let pin_based = ControlDefaults::from_msr(ControlGroup::PinBased, platform.read_msr(pin_msr));
        let primary_processor =
            ControlDefaults::from_msr(ControlGroup::PrimaryProcessor, platform.read_msr(proc_msr));
        let exit = ControlDefaults::from_msr(ControlGroup::Exit, platform.read_msr(exit_msr));
        let entry = ControlDefaults::from_msr(ControlGroup::Entry, platform.read_msr(entry_msr));

        let cr0_fixed = read_fixed_bits!(platform, CR0);
        let cr4_fixed = read_fixed_bits!(platform, CR4);

        let secondary_processor =
            if primary_processor.allows(PrimaryControls::SECONDARY_CONTROLS.bits()) {
                ControlDefaults::from_msr(
                    ControlGroup::SecondaryProcessor,
                    platform.read_msr(Msr::IA32_VMX_PROCBASED_CTLS2),
                )
            } else {
                ControlDefaults::absent(ControlGroup::SecondaryProcessor)
            };
        let secondary = SecondaryControls::from_bits_truncate(secondary_processor.allowed_1());

        let ept = secondary.contains(SecondaryControls::ENABLE_EPT);
        let vpid = secondary.contains(SecondaryControls::ENABLE_VPID);
        let flags = if ept || vpid {
            EptVpidCaps::from_bits_truncate(platform.read_msr(Msr::IA32_VMX_EPT_VPID_CAP))
        } else {
            EptVpidCaps::empty()
        };
        let vm_functions = secondary
            .contains(SecondaryControls::ENABLE_VM_FUNCTIONS)
            .then(|| platform.read_msr(Msr::IA32_VMX_VMFUNC));

        let snapshot = Self {
            supported: true,
            basic,
            pin_based,
            primary_processor,
            secondary_processor,
            exit,
            entry,
            cr0_fixed,
            cr4_fixed,
            isolation: IsolationCapabilities { ept, vpid, flags },
            unrestricted_guest: secondary.contains(SecondaryControls::UNRESTRICTED_GUEST),
            vm_functions,
        };
        debug!(
            "[VMX] capabilities: revision {:#x}, true controls {}, EPT {}, VPID {}",
            basic.revision_id, basic.true_controls, ept, vpid
        );
        Ok(snapshot)
    }

    /// The tag every VMXON and VMCS region must carry in its first word.
    pub fn region_format_revision(&self) -> u32 {
        self.basic.revision_id
    }

    pub fn extended_function_supported(&self) -> bool {
        self.vm_functions.is_some()
    }

    /// Defaults of one control group.
    pub fn control_defaults(&self, group: ControlGroup) -> &ControlDefaults {
        match group {
            ControlGroup::PinBased => &self.pin_based,
            ControlGroup::PrimaryProcessor => &self.primary_processor,
            ControlGroup::SecondaryProcessor => &self.secondary_processor,
            ControlGroup::Exit => &self.exit,
            ControlGroup::Entry => &self.entry,
        }
    }
}

static BOOT_SNAPSHOT: Once<CapabilitySnapshot> = Once::new();

/// Detect capabilities once per boot and share the result.
///
/// Capabilities cannot change while the processor is live, so later calls return the
/// first successful snapshot without touching the platform again.
pub fn boot_snapshot<P: VmxPlatform>(platform: &P) -> Result<&'static CapabilitySnapshot> {
    BOOT_SNAPSHOT.try_call_once(|| CapabilitySnapshot::detect(platform))
}
