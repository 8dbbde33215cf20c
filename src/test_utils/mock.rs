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

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use x86::vmx::{Result as InsnResult, VmFail};

use crate::vmx::{InvEptType, InvVpidType};
use crate::{GeneralRegisters, HostPhysAddr, HostVirtAddr, Msr, VmxHal, VmxPlatform};

const PAGE_SIZE: usize = 0x1000;

thread_local! {
    static LIVE_FRAMES: Cell<isize> = const { Cell::new(0) };
}

fn frame_layout() -> Layout {
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// Frames from the host allocator, physical address == virtual address.
#[derive(Debug)]
pub struct MockHal;

impl MockHal {
    /// Frames allocated and not yet returned by the current test thread.
    pub fn live_frames() -> isize {
        LIVE_FRAMES.with(|n| n.get())
    }
}

impl VmxHal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        let ptr = unsafe { alloc_zeroed(frame_layout()) };
        if ptr.is_null() {
            return None;
        }
        LIVE_FRAMES.with(|n| n.set(n.get() + 1));
        Some(HostPhysAddr::from(ptr as usize))
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        LIVE_FRAMES.with(|n| n.set(n.get() - 1));
        unsafe { dealloc(paddr.as_usize() as *mut u8, frame_layout()) }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }
}

/// A memory collaborator with nothing left to give.
#[derive(Debug)]
pub struct ExhaustedHal;

impl VmxHal for ExhaustedHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        None
    }

    fn dealloc_frame(_paddr: HostPhysAddr) {
        unreachable!("no frame was ever handed out")
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }
}

/// A state-changing call made on a [`MockPlatform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    WriteMsr(Msr, u64),
    WriteCr4(u64),
    Vmxon(u64),
    Vmxoff,
    Vmptrld(u64),
    Vmclear(u64),
    Vmwrite(u32, u64),
    Vmlaunch,
    Vmresume,
    Invept(InvEptType, [u64; 2]),
    Invvpid(InvVpidType, [u64; 2]),
    WriteHostState,
}

/// An instruction [`MockPlatform::fail_next`] can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Vmxoff,
    Vmclear,
    /// `VMREAD` of one field.
    Vmread(u32),
    Invept,
    Invvpid,
    WriteHostState,
}

const VM_INSTRUCTION_ERROR: u32 = 0x4400;
const EXIT_REASON: u32 = 0x4402;
const EXIT_QUALIFICATION: u32 = 0x6400;
const HOST_RIP: u32 = 0x6c16;
const CR4_VMXE: u64 = 1 << 13;

/// A VMX-capable processor in software.
///
/// Capability MSRs are those of a recent Intel core. The VMX instructions follow the
/// checks of the SDM that matter to this crate: revision identifiers, launch state, the
/// current-VMCS pointer and `VMfailValid` versus `VMfailInvalid`.
#[derive(Debug)]
pub struct MockPlatform {
    vmx: bool,
    cpuid_queries: Cell<usize>,
    msrs: BTreeMap<Msr, u64>,
    msr_reads: RefCell<Vec<Msr>>,
    cr0: u64,
    cr4: u64,
    vmxon_ptr: Option<u64>,
    current: Option<u64>,
    launched: BTreeSet<u64>,
    fields: RefCell<BTreeMap<u64, BTreeMap<u32, u64>>>,
    exits: VecDeque<(u32, u64)>,
    fail_next_entry: Option<u32>,
    injected: RefCell<Vec<(FailOn, u32)>>,
    ops: Vec<Op>,
    clock: Cell<u64>,
    launches: usize,
    resumes: usize,
    last_guest_regs: GeneralRegisters,
}

impl MockPlatform {
    pub const REVISION: u32 = 0x12;
    pub const DEFAULT_EXIT_REASON: u32 = 12;
    pub const CLOCK_STEP: u64 = 100;

    pub fn new() -> Self {
        let msrs = BTreeMap::from([
            (Msr::IA32_FEATURE_CONTROL, 0x5),
            (Msr::IA32_PAT, 0x0007_0406_0007_0406),
            (Msr::IA32_VMX_BASIC, 0x00da_0400_0000_0012),
            (Msr::IA32_VMX_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_PROCBASED_CTLS, 0xfff9_fffe_0401_e172),
            (Msr::IA32_VMX_EXIT_CTLS, 0x01ff_ffff_0003_6dff),
            (Msr::IA32_VMX_ENTRY_CTLS, 0x0003_ffff_0000_11ff),
            (Msr::IA32_VMX_MISC, 0x0000_0000_7004_c1e7),
            (Msr::IA32_VMX_CR0_FIXED0, 0x8000_0021),
            (Msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff),
            (Msr::IA32_VMX_CR4_FIXED0, 0x2000),
            (Msr::IA32_VMX_CR4_FIXED1, 0x0037_27ff),
            (Msr::IA32_VMX_PROCBASED_CTLS2, 0x0053_7fff_0000_0000),
            (Msr::IA32_VMX_EPT_VPID_CAP, 0x0000_0f01_0673_4141),
            (Msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_007f_0000_0016),
            (Msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xfff9_fffe_0400_6172),
            (Msr::IA32_VMX_TRUE_EXIT_CTLS, 0x01ff_ffff_0003_6dfb),
            (Msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0003_ffff_0000_11fb),
            (Msr::IA32_VMX_VMFUNC, 0x1),
            (Msr::IA32_EFER, 0xd01),
            (Msr::IA32_FS_BASE, 0),
            (Msr::IA32_GS_BASE, 0xffff_8880_7fc0_0000),
        ]);
        Self {
            vmx: true,
            cpuid_queries: Cell::new(0),
            msrs,
            msr_reads: RefCell::new(Vec::new()),
            cr0: 0x8005_0033,
            cr4: 0x0000_0620,
            vmxon_ptr: None,
            current: None,
            launched: BTreeSet::new(),
            fields: RefCell::new(BTreeMap::new()),
            exits: VecDeque::new(),
            fail_next_entry: None,
            injected: RefCell::new(Vec::new()),
            ops: Vec::new(),
            clock: Cell::new(0),
            launches: 0,
            resumes: 0,
            last_guest_regs: GeneralRegisters::default(),
        }
    }

    /// A processor whose CPUID does not report VMX.
    pub fn without_vmx() -> Self {
        Self {
            vmx: false,
            ..Self::new()
        }
    }

    pub fn set_msr(&mut self, msr: Msr, value: u64) {
        self.msrs.insert(msr, value);
    }

    pub fn msr(&self, msr: Msr) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    pub fn set_cr0(&mut self, value: u64) {
        self.cr0 = value;
    }

    pub fn cr4(&self) -> u64 {
        self.cr4
    }

    pub fn msr_reads(&self) -> Vec<Msr> {
        self.msr_reads.borrow().clone()
    }

    pub fn cpuid_queries(&self) -> usize {
        self.cpuid_queries.get()
    }

    pub fn in_root(&self) -> bool {
        self.vmxon_ptr.is_some()
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn launches(&self) -> usize {
        self.launches
    }

    pub fn resumes(&self) -> usize {
        self.resumes
    }

    /// Successful VM entries so far.
    pub fn entries(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, Op::Vmlaunch | Op::Vmresume))
            .count()
    }

    pub fn last_guest_regs(&self) -> GeneralRegisters {
        self.last_guest_regs
    }

    /// The next VM entry exits with this raw exit reason and qualification.
    pub fn queue_exit(&mut self, reason: u32, qualification: u64) {
        self.exits.push_back((reason, qualification));
    }

    /// The next VMLAUNCH or VMRESUME fails with VM-instruction error `code`.
    pub fn fail_next_entry(&mut self, code: u32) {
        self.fail_next_entry = Some(code);
    }

    /// The next execution of `insn` fails: `VMfailValid` with error `code` when a VMCS is
    /// current, `VMfailInvalid` otherwise.
    pub fn fail_next(&mut self, insn: FailOn, code: u32) {
        self.injected.borrow_mut().push((insn, code));
    }

    /// Consume a pending failure of `insn` and report it.
    fn injected(&self, insn: FailOn) -> InsnResult<()> {
        let mut injected = self.injected.borrow_mut();
        match injected.iter().position(|(i, _)| *i == insn) {
            Some(index) => {
                let (_, code) = injected.remove(index);
                drop(injected);
                self.fail(code)
            }
            None => Ok(()),
        }
    }

    fn revision_at(paddr: u64) -> u32 {
        unsafe { (paddr as *const u32).read_volatile() }
    }

    /// `VMfailValid` when a VMCS is current, `VMfailInvalid` otherwise.
    fn fail(&self, code: u32) -> InsnResult<()> {
        match self.current {
            Some(vmcs) => {
                self.fields
                    .borrow_mut()
                    .entry(vmcs)
                    .or_default()
                    .insert(VM_INSTRUCTION_ERROR, code as u64);
                Err(VmFail::VmFailValid)
            }
            None => Err(VmFail::VmFailInvalid),
        }
    }

    fn enter(&mut self, regs: &mut GeneralRegisters, resume: bool) -> InsnResult<()> {
        let Some(vmcs) = self.current else {
            return Err(VmFail::VmFailInvalid);
        };
        let launched = self.launched.contains(&vmcs);
        if resume && !launched {
            return self.fail(5);
        }
        if !resume && launched {
            return self.fail(4);
        }
        if let Some(code) = self.fail_next_entry.take() {
            return self.fail(code);
        }
        let (reason, qualification) = self
            .exits
            .pop_front()
            .unwrap_or((Self::DEFAULT_EXIT_REASON, 0));
        let mut fields = self.fields.borrow_mut();
        let fields = fields.entry(vmcs).or_default();
        fields.insert(EXIT_REASON, reason as u64);
        fields.insert(EXIT_QUALIFICATION, qualification);
        if reason & (1 << 31) == 0 {
            self.launched.insert(vmcs);
            self.ops.push(if resume { Op::Vmresume } else { Op::Vmlaunch });
        }
        self.last_guest_regs = *regs;
        Ok(())
    }
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl VmxPlatform for MockPlatform {
    fn vmx_present(&self) -> bool {
        self.cpuid_queries.set(self.cpuid_queries.get() + 1);
        self.vmx
    }

    fn read_msr(&self, msr: Msr) -> u64 {
        assert!(self.vmx, "{:?} read on a processor without VMX", msr);
        self.msr_reads.borrow_mut().push(msr);
        self.msr(msr)
    }

    unsafe fn write_msr(&mut self, msr: Msr, value: u64) {
        self.ops.push(Op::WriteMsr(msr, value));
        self.msrs.insert(msr, value);
    }

    fn read_cr0(&self) -> u64 {
        self.cr0
    }

    fn read_cr4(&self) -> u64 {
        self.cr4
    }

    unsafe fn write_cr4(&mut self, value: u64) {
        self.ops.push(Op::WriteCr4(value));
        self.cr4 = value;
    }

    unsafe fn vmxon(&mut self, paddr: HostPhysAddr) -> InsnResult<()> {
        let paddr = paddr.as_usize() as u64;
        assert_ne!(self.cr4 & CR4_VMXE, 0, "VMXON with CR4.VMXE clear raises #UD");
        if self.vmxon_ptr.is_some() {
            return self.fail(15);
        }
        if Self::revision_at(paddr) != Self::REVISION {
            return Err(VmFail::VmFailInvalid);
        }
        self.ops.push(Op::Vmxon(paddr));
        self.vmxon_ptr = Some(paddr);
        Ok(())
    }

    unsafe fn vmxoff(&mut self) -> InsnResult<()> {
        if self.vmxon_ptr.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        self.injected(FailOn::Vmxoff)?;
        self.ops.push(Op::Vmxoff);
        self.vmxon_ptr = None;
        self.current = None;
        Ok(())
    }

    unsafe fn vmptrld(&mut self, paddr: HostPhysAddr) -> InsnResult<()> {
        let paddr = paddr.as_usize() as u64;
        if self.vmxon_ptr.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        if self.vmxon_ptr == Some(paddr) {
            return self.fail(10);
        }
        if Self::revision_at(paddr) != Self::REVISION {
            return self.fail(11);
        }
        self.ops.push(Op::Vmptrld(paddr));
        self.current = Some(paddr);
        Ok(())
    }

    unsafe fn vmclear(&mut self, paddr: HostPhysAddr) -> InsnResult<()> {
        let paddr = paddr.as_usize() as u64;
        if self.vmxon_ptr.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        if self.vmxon_ptr == Some(paddr) {
            return self.fail(3);
        }
        self.injected(FailOn::Vmclear)?;
        self.ops.push(Op::Vmclear(paddr));
        self.launched.remove(&paddr);
        if self.current == Some(paddr) {
            self.current = None;
        }
        Ok(())
    }

    fn vmread(&self, field: u32) -> InsnResult<u64> {
        let vmcs = self.current.ok_or(VmFail::VmFailInvalid)?;
        self.injected(FailOn::Vmread(field))?;
        Ok(self
            .fields
            .borrow()
            .get(&vmcs)
            .and_then(|fields| fields.get(&field))
            .copied()
            .unwrap_or(0))
    }

    unsafe fn vmwrite(&mut self, field: u32, value: u64) -> InsnResult<()> {
        let Some(vmcs) = self.current else {
            return Err(VmFail::VmFailInvalid);
        };
        // Read-only data fields have bits 11:10 == 1.
        if (field >> 10) & 0b11 == 1 {
            return self.fail(13);
        }
        self.ops.push(Op::Vmwrite(field, value));
        self.fields
            .borrow_mut()
            .entry(vmcs)
            .or_default()
            .insert(field, value);
        Ok(())
    }

    unsafe fn vmlaunch(&mut self, regs: &mut GeneralRegisters) -> InsnResult<()> {
        self.launches += 1;
        self.enter(regs, false)
    }

    unsafe fn vmresume(&mut self, regs: &mut GeneralRegisters) -> InsnResult<()> {
        self.resumes += 1;
        self.enter(regs, true)
    }

    unsafe fn invept(&mut self, kind: InvEptType, descriptor: &[u64; 2]) -> InsnResult<()> {
        if self.vmxon_ptr.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        self.injected(FailOn::Invept)?;
        self.ops.push(Op::Invept(kind, *descriptor));
        Ok(())
    }

    unsafe fn invvpid(&mut self, kind: InvVpidType, descriptor: &[u64; 2]) -> InsnResult<()> {
        if self.vmxon_ptr.is_none() {
            return Err(VmFail::VmFailInvalid);
        }
        if descriptor[0] == 0 && kind != InvVpidType::AllContexts {
            return self.fail(28);
        }
        self.injected(FailOn::Invvpid)?;
        self.ops.push(Op::Invvpid(kind, *descriptor));
        Ok(())
    }

    unsafe fn write_host_state(&mut self) -> InsnResult<()> {
        let Some(vmcs) = self.current else {
            return Err(VmFail::VmFailInvalid);
        };
        self.injected(FailOn::WriteHostState)?;
        self.ops.push(Op::WriteHostState);
        self.fields
            .borrow_mut()
            .entry(vmcs)
            .or_default()
            .insert(HOST_RIP, 0xffff_ffff_8000_0000);
        Ok(())
    }

    fn timestamp(&self) -> u64 {
        let now = self.clock.get() + Self::CLOCK_STEP;
        self.clock.set(now);
        now
    }
}
