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

mod capability;
mod definitions;
mod dispatch;
mod instructions;
mod isolation;
mod mode;
mod percpu;
mod region;
mod structs;
mod telemetry;
mod vmcs;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod native;
        pub use self::native::X86Platform;
    }
}

use x86::vmx::VmFail;

pub use self::capability::{
    boot_snapshot, CapabilitySnapshot, ControlDefaults, ControlGroup, FixedBits,
    IsolationCapabilities,
};
pub use self::definitions::{VmxExitReason, VmxInstructionError, VmxRawExitReason};
pub use self::dispatch::{Dispatcher, ExitHandler, ExitRecord};
pub use self::instructions::{InvEptType, InvVpidType};
pub use self::isolation::{IsolationTag, VpidAllocator};
pub use self::mode::{Disabled, Enabled, Mode, ModeState, Root, VmxCpu};
pub use self::percpu::VmxPerCpuState;
pub use self::region::{RawRegion, Region, RegionKind, Vmcs, VmcsRegion, Vmxon, VmxonRegion};
pub use self::structs::{EptVpidCaps, VmxBasic};
pub use self::telemetry::{Telemetry, TelemetrySnapshot};
pub use self::vmcs::{
    VmcsControl16, VmcsControl32, VmcsControl64, VmcsGuest16, VmcsGuest32, VmcsGuest64,
    VmcsGuestNW, VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW, VmcsReadOnly32, VmcsReadOnly64,
    VmcsReadOnlyNW, VmcsReadable, VmcsWritable,
};

use crate::{VmxError, VmxPlatform};

/// Decode a failed VMX instruction. `VMfailValid` carries the VM-instruction error field
/// of the current VMCS.
fn as_vmx_error<P: VmxPlatform>(platform: &P, err: VmFail) -> VmxError {
    match err {
        VmFail::VmFailValid => VmxError::ValidFailure(vmcs::instruction_error(platform)),
        VmFail::VmFailInvalid => VmxError::InvalidFailure,
    }
}
