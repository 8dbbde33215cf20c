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

#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

mod error;
mod frame;
mod hal;
pub(crate) mod msr;
mod platform;
mod regs;
mod vmx;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use error::{Rejected, Refused, Result, VmxError};
pub use frame::PhysFrame;
pub use hal::{HostPhysAddr, HostVirtAddr, VmxHal};
pub use msr::Msr;
pub use platform::VmxPlatform;
pub use regs::GeneralRegisters;

pub use vmx::{
    CapabilitySnapshot, ControlDefaults, ControlGroup, Disabled, Dispatcher, Enabled,
    EptVpidCaps, ExitHandler, ExitRecord, FixedBits, InvEptType, InvVpidType,
    IsolationCapabilities, IsolationTag, Mode, ModeState, RawRegion, Region, RegionKind, Root,
    Telemetry, TelemetrySnapshot, Vmcs, VmcsControl16, VmcsControl32, VmcsControl64,
    VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW, VmcsHost16, VmcsHost32, VmcsHost64,
    VmcsHostNW, VmcsReadOnly32, VmcsReadOnly64, VmcsReadOnlyNW, VmcsReadable, VmcsRegion,
    VmcsWritable, VmxBasic, VmxCpu, VmxExitReason, VmxInstructionError, VmxPerCpuState,
    VmxRawExitReason, Vmxon, VmxonRegion, VpidAllocator, boot_snapshot,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use vmx::X86Platform;
    }
}
