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

use super::definitions::VmxExitReason;
use super::mode::{Root, VmxCpu};
use super::telemetry::Telemetry;
use super::vmcs::VmcsReadOnlyNW;
use crate::{GeneralRegisters, Result, VmxHal, VmxPlatform};

/// What the processor reported when control came back to root operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    /// Basic exit reason, bits 15:0 of the exit-reason field.
    pub reason_code: u16,
    /// Whether the exit reports a failed VM entry (bit 31 of the exit-reason field).
    pub entry_failure: bool,
    /// Exit qualification.
    pub qualification: u64,
    /// Platform timestamp taken right after the exit.
    pub timestamp: u64,
}

impl ExitRecord {
    pub fn reason(&self) -> Option<VmxExitReason> {
        VmxExitReason::try_from(self.reason_code as u32).ok()
    }
}

/// Consumer of exit records: the part of a hypervisor that gives exits their meaning.
pub trait ExitHandler {
    type Output;

    fn on_exit(&mut self, record: &ExitRecord, regs: &mut GeneralRegisters) -> Self::Output;
}

impl<F, T> ExitHandler for F
where
    F: FnMut(&ExitRecord, &mut GeneralRegisters) -> T,
{
    type Output = T;

    fn on_exit(&mut self, record: &ExitRecord, regs: &mut GeneralRegisters) -> T {
        self(record, regs)
    }
}

/// Runs guests and turns each VM exit into an [`ExitRecord`].
///
/// The dispatcher counts entries and exits but never looks at what an exit means.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'t> {
    telemetry: &'t Telemetry,
}

impl<'t> Dispatcher<'t> {
    pub fn new(telemetry: &'t Telemetry) -> Self {
        Self { telemetry }
    }

    pub fn telemetry(&self) -> &'t Telemetry {
        self.telemetry
    }

    /// `VMLAUNCH` the current VMCS.
    pub fn launch<P: VmxPlatform, H: VmxHal>(
        &self,
        cpu: &mut VmxCpu<'_, P, H, Root>,
        regs: &mut GeneralRegisters,
    ) -> Result<ExitRecord> {
        self.enter(cpu, regs, false)
    }

    /// `VMRESUME` the current VMCS.
    pub fn resume<P: VmxPlatform, H: VmxHal>(
        &self,
        cpu: &mut VmxCpu<'_, P, H, Root>,
        regs: &mut GeneralRegisters,
    ) -> Result<ExitRecord> {
        self.enter(cpu, regs, true)
    }

    /// Enter the guest with whichever of `VMLAUNCH` and `VMRESUME` the current VMCS needs.
    pub fn run<P: VmxPlatform, H: VmxHal>(
        &self,
        cpu: &mut VmxCpu<'_, P, H, Root>,
        regs: &mut GeneralRegisters,
    ) -> Result<ExitRecord> {
        let resume = cpu.is_launched();
        self.enter(cpu, regs, resume)
    }

    /// Run the guest once and hand the exit to `handler`.
    pub fn dispatch<P: VmxPlatform, H: VmxHal, X: ExitHandler>(
        &self,
        cpu: &mut VmxCpu<'_, P, H, Root>,
        regs: &mut GeneralRegisters,
        handler: &mut X,
    ) -> Result<X::Output> {
        let record = self.run(cpu, regs)?;
        Ok(handler.on_exit(&record, regs))
    }

    fn enter<P: VmxPlatform, H: VmxHal>(
        &self,
        cpu: &mut VmxCpu<'_, P, H, Root>,
        regs: &mut GeneralRegisters,
        resume: bool,
    ) -> Result<ExitRecord> {
        let entered_at = cpu.platform().timestamp();
        let result = if resume {
            cpu.resume(regs)
        } else {
            cpu.launch(regs)
        };
        let raw = match result {
            Ok(raw) => raw,
            Err(err) => {
                self.telemetry.record_failed_entry();
                warn!("[VMX] CPU {} VM entry failed: {}", cpu.cpu_id(), err);
                return Err(err);
            }
        };
        let timestamp = cpu.platform().timestamp();
        if raw.entry_failure() {
            self.telemetry.record_failed_entry();
            warn!(
                "[VMX] CPU {} VM entry failed with exit reason {}",
                cpu.cpu_id(),
                raw.basic()
            );
        } else {
            self.telemetry.record_entry(entered_at);
            self.telemetry.record_exit(raw.basic(), entered_at, timestamp);
        }

        let record = ExitRecord {
            reason_code: raw.basic(),
            entry_failure: raw.entry_failure(),
            qualification: cpu.read(VmcsReadOnlyNW::EXIT_QUALIFICATION)?,
            timestamp,
        };
        #[cfg(feature = "tracing")]
        trace!("[VMX] CPU {} {:#x?}", cpu.cpu_id(), record);
        #[cfg(not(feature = "tracing"))]
        trace!(
            "[VMX] CPU {} VM exit reason {}",
            cpu.cpu_id(),
            record.reason_code
        );
        Ok(record)
    }
}
