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

use super::capability::CapabilitySnapshot;
use super::definitions::VmxInstructionError;
use super::mode::{Disabled, Enabled, ModeState, Root, VmxCpu};
use super::region::{RawRegion, VmxonRegion};
use crate::{Result, VmxError, VmxHal, VmxPlatform};

enum Inner<'a, P: VmxPlatform, H: VmxHal> {
    Disabled(VmxCpu<'a, P, H, Disabled>),
    Enabled(VmxCpu<'a, P, H, Enabled>),
    Root(VmxCpu<'a, P, H, Root>),
}

/// Represents the per-CPU state for Virtual Machine Extensions (VMX).
///
/// Holds one [`VmxCpu`] in whatever mode it currently is, for callers that track the
/// mode at runtime (a per-CPU variable initialized at boot, for instance). Turning VMX
/// on allocates and stamps the VMXON region; turning it off releases it.
pub struct VmxPerCpuState<'a, P: VmxPlatform, H: VmxHal> {
    /// `None` only while a transition is in progress.
    inner: Option<Inner<'a, P, H>>,
}

impl<'a, P: VmxPlatform, H: VmxHal> VmxPerCpuState<'a, P, H> {
    pub fn new(platform: P, caps: &'a CapabilitySnapshot, cpu_id: usize) -> Self {
        Self {
            inner: Some(Inner::Disabled(VmxCpu::<'a, P, H, Disabled>::new(
                platform, caps, cpu_id,
            ))),
        }
    }

    pub fn mode(&self) -> ModeState {
        match &self.inner {
            Some(Inner::Disabled(_)) | None => ModeState::Disabled,
            Some(Inner::Enabled(_)) => ModeState::Enabled,
            Some(Inner::Root(_)) => ModeState::Root,
        }
    }

    /// Whether this CPU is in VMX root operation.
    pub fn is_enabled(&self) -> bool {
        matches!(self.inner, Some(Inner::Root(_)))
    }

    /// The core in root operation, if it is.
    pub fn root_mut(&mut self) -> Option<&mut VmxCpu<'a, P, H, Root>> {
        match &mut self.inner {
            Some(Inner::Root(cpu)) => Some(cpu),
            _ => None,
        }
    }

    /// Turn VMX on and enter root operation.
    ///
    /// Fails with [`VmxInstructionError::VMXON_IN_ROOT`] when already in root operation,
    /// which is what the processor itself would report.
    pub fn hardware_enable(&mut self) -> Result {
        let Some(inner) = self.inner.take() else {
            return Err(VmxError::InvalidFailure);
        };
        match inner {
            Inner::Root(cpu) => {
                self.inner = Some(Inner::Root(cpu));
                Err(VmxError::ValidFailure(VmxInstructionError::VMXON_IN_ROOT))
            }
            Inner::Enabled(cpu) => self.enter_root(cpu),
            Inner::Disabled(cpu) => match cpu.enable() {
                Ok(cpu) => self.enter_root(cpu),
                Err(rejected) => {
                    let (cpu, err) = rejected.into_parts();
                    self.inner = Some(Inner::Disabled(cpu));
                    Err(err)
                }
            },
        }
    }

    fn enter_root(&mut self, cpu: VmxCpu<'a, P, H, Enabled>) -> Result {
        let region: VmxonRegion<H> = match RawRegion::alloc() {
            Ok(raw) => raw.stamp(cpu.capabilities()),
            Err(err) => {
                self.inner = Some(Inner::Enabled(cpu));
                return Err(err);
            }
        };
        match cpu.enter_root(region) {
            Ok(cpu) => {
                self.inner = Some(Inner::Root(cpu));
                Ok(())
            }
            Err(rejected) => {
                let ((cpu, _region), err) = rejected.into_parts();
                self.inner = Some(Inner::Enabled(cpu));
                Err(err)
            }
        }
    }

    /// Leave root operation and turn VMX off.
    ///
    /// The current VMCS, if any, is cleared and released first. Does nothing when VMX is
    /// already off.
    pub fn hardware_disable(&mut self) -> Result {
        let Some(inner) = self.inner.take() else {
            return Err(VmxError::InvalidFailure);
        };
        match inner {
            Inner::Disabled(cpu) => {
                self.inner = Some(Inner::Disabled(cpu));
                Ok(())
            }
            Inner::Enabled(cpu) => {
                self.inner = Some(Inner::Disabled(cpu.disable()));
                Ok(())
            }
            Inner::Root(mut cpu) => {
                if cpu.current_region().is_some() {
                    if let Err(err) = cpu.clear_current() {
                        self.inner = Some(Inner::Root(cpu));
                        return Err(err);
                    }
                }
                match cpu.exit_root() {
                    Ok((cpu, _vmxon)) => {
                        self.inner = Some(Inner::Disabled(cpu.disable()));
                        Ok(())
                    }
                    Err(rejected) => {
                        let (cpu, err) = rejected.into_parts();
                        self.inner = Some(Inner::Root(cpu));
                        Err(err)
                    }
                }
            }
        }
    }
}

impl<P: VmxPlatform, H: VmxHal> core::fmt::Debug for VmxPerCpuState<'_, P, H> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match &self.inner {
            Some(Inner::Disabled(cpu)) => core::fmt::Debug::fmt(cpu, f),
            Some(Inner::Enabled(cpu)) => core::fmt::Debug::fmt(cpu, f),
            Some(Inner::Root(cpu)) => core::fmt::Debug::fmt(cpu, f),
            None => f.write_str("VmxPerCpuState(<in transition>)"),
        }
    }
}
