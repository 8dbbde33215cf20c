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

use axerrno::AxError;

use crate::vmx::{ControlGroup, VmxInstructionError};

/// Errors reported by the VMX control plane.
///
/// `InvalidFailure` and `ValidFailure` mirror the two hardware failure conventions of the
/// VMX instruction family (`VMfailInvalid`, `CF = 1` and `VMfailValid`, `ZF = 1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmxError {
    /// The processor (or its firmware configuration) does not offer the requested feature.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// A VMX instruction failed and no current VMCS exists to report why.
    #[error("VMX instruction failed without a current VMCS")]
    InvalidFailure,
    /// A VMX instruction failed; the VM-instruction error field tells which check.
    #[error("VMX instruction failed: {0}")]
    ValidFailure(VmxInstructionError),
    /// Requested control bits that the processor forces to zero.
    #[error("{group:?} controls {bits:#x} are not allowed to be 1")]
    ControlNotAllowed { group: ControlGroup, bits: u32 },
    /// A control register does not satisfy the VMX fixed-bit constraints.
    #[error("{0} violates the VMX fixed-bit constraints")]
    FixedBitsViolated(&'static str),
    /// Another VMCS is still current on this core.
    #[error("a VMCS is already current on this CPU")]
    RegionBusy,
    /// Every virtual-processor identifier has been handed out.
    #[error("isolation tags exhausted")]
    TagsExhausted,
    /// The memory collaborator could not provide a frame.
    #[error("physical frame allocation failed")]
    NoMemory,
}

/// A specialized [`Result`](core::result::Result) type for VMX operations.
pub type Result<T = ()> = core::result::Result<T, VmxError>;

impl From<VmxError> for AxError {
    fn from(err: VmxError) -> Self {
        match err {
            VmxError::Unsupported(_) => AxError::Unsupported,
            VmxError::InvalidFailure | VmxError::ValidFailure(_) => AxError::BadState,
            VmxError::ControlNotAllowed { .. } | VmxError::FixedBitsViolated(_) => {
                AxError::InvalidInput
            }
            VmxError::RegionBusy => AxError::ResourceBusy,
            VmxError::TagsExhausted | VmxError::NoMemory => AxError::NoMemory,
        }
    }
}

/// A mode transition that did not happen.
///
/// Transitions consume the per-core state; on failure the state is handed back untouched
/// in `cpu` together with the reason.
pub struct Rejected<C> {
    pub cpu: C,
    pub error: VmxError,
}

impl<C> Rejected<C> {
    pub(crate) fn new(cpu: C, error: VmxError) -> Self {
        Self { cpu, error }
    }

    /// Split into the handed-back state and the error.
    pub fn into_parts(self) -> (C, VmxError) {
        (self.cpu, self.error)
    }
}

impl<C> fmt::Debug for Rejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<C> fmt::Display for Rejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "transition rejected: {}", self.error)
    }
}

/// A region the core refused to take, handed back with the reason.
pub struct Refused<R> {
    pub region: R,
    pub error: VmxError,
}

impl<R> fmt::Debug for Refused<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Refused")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<R> fmt::Display for Refused<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "region refused: {}", self.error)
    }
}
