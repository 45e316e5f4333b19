//! CPU core: register file, fetch/decode/execute, traps and interrupts.
//!
//! A core advances one instruction per scheduler round. The per-tick
//! algorithm:
//!
//! 1. Convert the previous instruction's trap (if any) into an interrupt
//!    on the reserved fault vector.
//! 2. Otherwise, if hardware interrupts are enabled, service the
//!    highest-priority pending IRQ.
//! 3. If the core is halted (IDLE), yield.
//! 4. Fetch through the MMU, decode (instruction cache), execute.
//!
//! A fault raised anywhere in step 4 rolls the instruction pointer back
//! to the faulting instruction and is delivered at the next boundary, so
//! interrupt delivery is always atomic with respect to instruction
//! boundaries.
//!
//! ## Interrupt frame
//!
//! Entry switches to the handler stack from the vector, then pushes
//! (descending addresses): fault context word 1 (address or IRQ number),
//! fault context word 2 (access kind), the interrupted `sp`, the flags
//! word, `ip`, and `fp`; finally `fp <- sp`. A handler therefore sees
//! `[fp+0]` = saved fp, `[fp+4]` = saved ip, `[fp+8]` = flags,
//! `[fp+12]` = old sp, `[fp+16]` = context 2, `[fp+20]` = context 1.
//! `RETINT` unwinds the frame and restores `sp` wholesale, so the
//! context words never need popping.

pub mod isa;
pub mod math;
pub mod mmu;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::bus::DeviceBus;
use crate::device::{DeviceContext, Width};
use crate::error::{AccessKind, Fault};
use crate::irq::InterruptController;
use crate::memory::MemoryController;
use isa::{AluOp, Cond, Instruction, Operand, Reg, Target};
use math::MathCoprocessor;
use mmu::Mmu;

/// Number of general-purpose registers (`r0..r29`).
pub const GP_REGISTERS: usize = 30;

/// The per-core register file. `ip` is updated only by control-flow and
/// trap logic, never as an instruction operand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFile {
    pub r: [u32; GP_REGISTERS],
    pub fp: u32,
    pub sp: u32,
    pub ip: u32,
}

impl RegisterFile {
    pub fn get(&self, reg: Reg) -> u32 {
        match reg.0 as usize {
            30 => self.fp,
            31 => self.sp,
            n => self.r[n],
        }
    }

    pub fn set(&mut self, reg: Reg, value: u32) {
        match reg.0 as usize {
            30 => self.fp = value,
            31 => self.sp = value,
            n => self.r[n] = value,
        }
    }
}

/// The flags word: {privileged, halted, equal, zero, overflow, sign,
/// hardware-interrupts-enabled}.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreFlags {
    pub privileged: bool,
    pub halted: bool,
    pub equal: bool,
    pub zero: bool,
    pub overflow: bool,
    pub sign: bool,
    pub hwint_enabled: bool,
}

impl CoreFlags {
    pub fn to_word(self) -> u32 {
        (self.privileged as u32)
            | (self.halted as u32) << 1
            | (self.equal as u32) << 2
            | (self.zero as u32) << 3
            | (self.overflow as u32) << 4
            | (self.sign as u32) << 5
            | (self.hwint_enabled as u32) << 6
    }

    pub fn from_word(word: u32) -> Self {
        Self {
            privileged: word & 1 != 0,
            halted: word & 1 << 1 != 0,
            equal: word & 1 << 2 != 0,
            zero: word & 1 << 3 != 0,
            overflow: word & 1 << 4 != 0,
            sign: word & 1 << 5 != 0,
            hwint_enabled: word & 1 << 6 != 0,
        }
    }
}

impl std::fmt::Display for CoreFlags {
    /// `PHEZOSI` style string, `-` for a cleared flag.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (set, label) in [
            (self.privileged, 'P'),
            (self.halted, 'H'),
            (self.equal, 'E'),
            (self.zero, 'Z'),
            (self.overflow, 'O'),
            (self.sign, 'S'),
            (self.hwint_enabled, 'I'),
        ] {
            write!(f, "{}", if set { label } else { '-' })?;
        }
        Ok(())
    }
}

/// What a tick produced, as far as the machine is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// Advanced normally (possibly into a handler).
    Ok,
    /// Core is halted/idle; nothing executed.
    Idle,
    /// Core is no longer alive.
    Dead,
    /// `HLT 0`: this core stops, the machine keeps running.
    CoreHalted,
    /// `HLT n` (n != 0): the whole machine stops with this exit code.
    MachineHalted(u32),
    /// Unrecoverable fault (double fault during double-fault delivery).
    Fatal(Fault),
}

/// Everything outside the core that one tick may touch.
pub struct ExecCtx<'a> {
    pub mem: &'a mut MemoryController,
    pub bus: &'a mut DeviceBus,
    /// Device IRQs raised during this tick.
    pub raised: &'a mut Vec<u32>,
    /// Virtual-time counter.
    pub now: u64,
    pub snapshot_requested: &'a mut bool,
    /// Host input routed between devices.
    pub input: &'a mut Vec<(usize, u8)>,
    /// Inter-processor interrupts queued this tick: (target core, irq).
    pub ipis: &'a mut Vec<(usize, u32)>,
}

impl<'a> ExecCtx<'a> {
    fn device_ctx(&mut self) -> (DeviceContext<'_>, &mut DeviceBus) {
        (
            DeviceContext {
                mem: &mut *self.mem,
                raised: &mut *self.raised,
                now: self.now,
                snapshot_requested: &mut *self.snapshot_requested,
                input: &mut *self.input,
            },
            &mut *self.bus,
        )
    }
}

enum Exec {
    Normal,
    Halt(u32),
}

/// One CPU core.
pub struct Core {
    pub id: usize,
    pub regs: RegisterFile,
    pub flags: CoreFlags,
    pub mmu: Mmu,
    pub pic: InterruptController,
    pub math: Option<MathCoprocessor>,
    /// Active instruction set: 0 = main, 1 = math coprocessor.
    inst_set: u32,
    /// Sets saved across interrupt entries.
    inst_set_stack: Vec<u32>,
    pub alive: bool,
    pub exit_code: u32,
    /// Trap raised by the current instruction, delivered at the next
    /// boundary.
    pending_fault: Option<Fault>,
    /// Validate CALL/RET frame discipline.
    check_frames: bool,
    frames: Vec<u32>,
    /// Per-mnemonic execution counts when profiling is on.
    pub profile: Option<std::collections::HashMap<&'static str, u64>>,
}

impl Core {
    pub fn new(id: usize, math_coprocessor: bool, check_frames: bool) -> Self {
        Self {
            id,
            regs: RegisterFile::default(),
            flags: CoreFlags {
                privileged: true,
                ..Default::default()
            },
            mmu: Mmu::new(id),
            pic: InterruptController::new(),
            math: math_coprocessor.then(MathCoprocessor::new),
            inst_set: 0,
            inst_set_stack: Vec::new(),
            alive: false,
            exit_code: 0,
            pending_fault: None,
            check_frames,
            frames: Vec::new(),
            profile: None,
        }
    }

    /// Reset to power-on state with the given entry point. Privileged,
    /// interrupts disabled, caches flushed.
    pub fn reset(&mut self, entry: u32) {
        self.regs = RegisterFile::default();
        self.flags = CoreFlags {
            privileged: true,
            ..Default::default()
        };
        self.inst_set = 0;
        self.inst_set_stack.clear();
        self.pending_fault = None;
        self.frames.clear();
        self.regs.ip = entry;
        self.mmu.reset();
        if let Some(math) = &mut self.math {
            math.reset();
        }
    }

    /// Mark the core runnable.
    pub fn boot(&mut self, entry: u32, sp: u32) {
        self.reset(entry);
        self.regs.sp = sp;
        self.regs.fp = sp;
        self.alive = true;
        debug!("core #{}: up, ip=0x{:08x}, sp=0x{:08x}", self.id, entry, sp);
    }

    pub fn instruction_set(&self) -> u32 {
        self.inst_set
    }

    /// Capture this core's state for a snapshot.
    pub fn save_state(&self) -> crate::snapshot::CoreState {
        crate::snapshot::CoreState {
            id: self.id,
            regs: self.regs.clone(),
            flags: self.flags.to_word(),
            inst_set: self.inst_set,
            inst_set_stack: self.inst_set_stack.clone(),
            alive: self.alive,
            exit_code: self.exit_code,
            pending_fault: self.pending_fault,
            frames: self.frames.clone(),
            pic: self.pic.clone(),
            pt_base: self.mmu.pt_base(),
            pt_enabled: self.mmu.pt_enabled(),
            math: self.math.clone(),
        }
    }

    /// Restore from a snapshot. The advisory caches are flushed, not
    /// restored.
    pub fn load_state(&mut self, state: &crate::snapshot::CoreState) {
        self.regs = state.regs.clone();
        self.flags = CoreFlags::from_word(state.flags);
        self.inst_set = state.inst_set;
        self.inst_set_stack = state.inst_set_stack.clone();
        self.alive = state.alive;
        self.exit_code = state.exit_code;
        self.pending_fault = state.pending_fault;
        self.frames = state.frames.clone();
        self.pic = state.pic.clone();
        self.mmu.set_pt_base(state.pt_base);
        self.mmu.set_pt_enabled(state.pt_enabled);
        self.mmu.flush_icache();
        self.math = state.math.clone();
    }

    // -- Memory access through MMU + bus ---------------------------------

    fn load(&mut self, ctx: &mut ExecCtx<'_>, vaddr: u32, width: Width) -> Result<u32, Fault> {
        let paddr = self
            .mmu
            .translate(ctx.mem, vaddr, AccessKind::Read, self.flags.privileged)?;

        if ctx.mem.contains(paddr) {
            match width {
                Width::Byte => ctx.mem.read_u8(paddr).map(u32::from),
                Width::Short => ctx.mem.read_u16(paddr).map(u32::from),
                Width::Word => ctx.mem.read_u32(paddr),
            }
        } else {
            let (mut dctx, bus) = ctx.device_ctx();
            bus.mmio_read(&mut dctx, paddr, width)
        }
    }

    fn store(
        &mut self,
        ctx: &mut ExecCtx<'_>,
        vaddr: u32,
        width: Width,
        value: u32,
    ) -> Result<(), Fault> {
        let paddr = self
            .mmu
            .translate(ctx.mem, vaddr, AccessKind::Write, self.flags.privileged)?;

        if ctx.mem.contains(paddr) {
            match width {
                Width::Byte => ctx.mem.write_u8(paddr, value as u8),
                Width::Short => ctx.mem.write_u16(paddr, value as u16),
                Width::Word => ctx.mem.write_u32(paddr, value),
            }
        } else {
            let (mut dctx, bus) = ctx.device_ctx();
            bus.mmio_write(&mut dctx, paddr, width, value)
        }
    }

    /// Push a word on the data stack (`sp` decrements by four first).
    fn push_word(&mut self, ctx: &mut ExecCtx<'_>, value: u32) -> Result<(), Fault> {
        self.regs.sp = self.regs.sp.wrapping_sub(4);
        self.store(ctx, self.regs.sp, Width::Word, value)
    }

    /// Pop a word from the data stack.
    fn pop_word(&mut self, ctx: &mut ExecCtx<'_>) -> Result<u32, Fault> {
        let value = self.load(ctx, self.regs.sp, Width::Word)?;
        self.regs.sp = self.regs.sp.wrapping_add(4);
        Ok(value)
    }

    // -- Interrupt entry / exit ------------------------------------------

    /// Switch into the handler for vector `irq`. See the module docs for
    /// the frame layout.
    fn enter_interrupt(
        &mut self,
        ctx: &mut ExecCtx<'_>,
        irq: u32,
        context1: u32,
        context2: u32,
    ) -> Result<(), Fault> {
        let vector = self.pic.load_vector(ctx.mem, irq)?;

        debug!(
            "core #{}: enter irq {}: handler ip=0x{:08x}, sp=0x{:08x}",
            self.id, irq, vector.ip, vector.sp
        );

        let old_sp = self.regs.sp;
        self.regs.sp = vector.sp;

        self.push_hw(ctx, context1)?;
        self.push_hw(ctx, context2)?;
        self.push_hw(ctx, old_sp)?;
        self.push_hw(ctx, self.flags.to_word())?;
        self.push_hw(ctx, self.regs.ip)?;
        self.push_hw(ctx, self.regs.fp)?;
        self.regs.fp = self.regs.sp;
        if self.check_frames {
            self.frames.push(self.regs.fp);
        }

        self.flags.privileged = true;
        self.flags.hwint_enabled = false;
        self.flags.halted = false;
        self.inst_set_stack.push(self.inst_set);
        self.inst_set = 0;
        self.regs.ip = vector.ip;
        Ok(())
    }

    /// `RETINT`: unwind the interrupt frame.
    fn exit_interrupt(&mut self, ctx: &mut ExecCtx<'_>) -> Result<(), Fault> {
        if self.check_frames {
            match self.frames.pop() {
                Some(fp) if fp == self.regs.sp => {}
                frame => {
                    warn!(
                        "core #{}: retint with bad frame: saved={:?}, sp=0x{:08x}",
                        self.id, frame, self.regs.sp
                    );
                    return Err(Fault::AccessViolation {
                        addr: self.regs.sp,
                        kind: AccessKind::Read,
                    });
                }
            }
        }

        let fp = self.pop_hw(ctx)?;
        let ip = self.pop_hw(ctx)?;
        let flags = self.pop_hw(ctx)?;
        let old_sp = self.pop_hw(ctx)?;

        self.regs.fp = fp;
        self.regs.ip = ip;
        self.flags = CoreFlags::from_word(flags);
        // Context words need no pop: the stack pointer is restored
        // wholesale.
        self.regs.sp = old_sp;
        self.inst_set = self.inst_set_stack.pop().unwrap_or(0);
        Ok(())
    }

    /// Hardware push: physical, bypasses translation (handler stacks are
    /// kernel-addressed).
    fn push_hw(&mut self, ctx: &mut ExecCtx<'_>, value: u32) -> Result<(), Fault> {
        self.regs.sp = self.regs.sp.wrapping_sub(4);
        ctx.mem.write_u32(self.regs.sp, value)
    }

    fn pop_hw(&mut self, ctx: &mut ExecCtx<'_>) -> Result<u32, Fault> {
        let value = ctx.mem.read_u32(self.regs.sp)?;
        self.regs.sp = self.regs.sp.wrapping_add(4);
        Ok(value)
    }

    /// Deliver a trap; escalates to double fault, then to fatal.
    fn deliver_fault(&mut self, ctx: &mut ExecCtx<'_>, fault: Fault) -> Result<(), Fault> {
        debug!("core #{}: delivering fault: {}", self.id, fault);

        // Fault code: access kind in the low bits, bit 2 set when the
        // fault was raised from user mode.
        let user_bit = if self.flags.privileged { 0 } else { 1 << 2 };

        match self.enter_interrupt(
            ctx,
            fault.vector(),
            fault.context_addr(),
            fault.context_kind() | user_bit,
        ) {
            Ok(()) => Ok(()),
            Err(_) if fault == Fault::DoubleFault => Err(Fault::DoubleFault),
            Err(second) => {
                debug!(
                    "core #{}: fault during delivery ({}), escalating to double fault",
                    self.id, second
                );
                match self.enter_interrupt(ctx, Fault::DoubleFault.vector(), 0, 0) {
                    Ok(()) => Ok(()),
                    Err(_) => Err(Fault::DoubleFault),
                }
            }
        }
    }

    /// Raise an IRQ on this core (device routing, IPI delivery).
    pub fn raise_irq(&mut self, irq: u32) {
        if let Err(fault) = self.pic.raise(irq) {
            warn!("core #{}: dropped IRQ: {}", self.id, fault);
        }
    }

    // -- Per-tick algorithm ----------------------------------------------

    /// Advance this core by one instruction.
    pub fn tick(&mut self, ctx: &mut ExecCtx<'_>) -> StepResult {
        if !self.alive {
            return StepResult::Dead;
        }

        // Traps convert to interrupts at the boundary; a pending fault
        // wins over device IRQs (it is the reserved-vector path).
        if let Some(fault) = self.pending_fault.take() {
            if let Err(fatal) = self.deliver_fault(ctx, fault) {
                self.alive = false;
                self.exit_code = 1;
                return StepResult::Fatal(fatal);
            }
        } else if self.flags.hwint_enabled {
            if let Some(irq) = self.pic.pop_next() {
                if let Err(fault) = self.enter_interrupt(ctx, irq, irq, 0) {
                    // A fault during IRQ entry takes the fault path,
                    // escalating to double fault as needed.
                    if let Err(fatal) = self.deliver_fault(ctx, fault) {
                        self.alive = false;
                        self.exit_code = 1;
                        return StepResult::Fatal(fatal);
                    }
                }
            }
        }

        if self.flags.halted {
            return StepResult::Idle;
        }

        let current_ip = self.regs.ip;

        let result = self.fetch_execute(ctx, current_ip);

        match result {
            Ok(Exec::Normal) => StepResult::Ok,
            Ok(Exec::Halt(0)) => {
                self.alive = false;
                self.exit_code = 0;
                debug!("core #{}: halted", self.id);
                StepResult::CoreHalted
            }
            Ok(Exec::Halt(code)) => {
                self.alive = false;
                self.exit_code = code;
                debug!("core #{}: machine halt, code={}", self.id, code);
                StepResult::MachineHalted(code)
            }
            Err(fault) => {
                trace!("core #{}: trap at 0x{:08x}: {}", self.id, current_ip, fault);
                self.regs.ip = current_ip;
                self.pending_fault = Some(fault);
                StepResult::Ok
            }
        }
    }

    fn fetch_execute(&mut self, ctx: &mut ExecCtx<'_>, ip: u32) -> Result<Exec, Fault> {
        if self.inst_set == 1 {
            // Coprocessor escape: raw fetch, math decode. The decoded-
            // instruction cache only holds main-set decodes.
            let paddr = self
                .mmu
                .translate(ctx.mem, ip, AccessKind::Execute, self.flags.privileged)?;
            let word = ctx.mem.read_u32(paddr)?;
            let op = math::decode(word)?;
            self.regs.ip = ip.wrapping_add(4);

            let math = self.math.as_mut().ok_or(Fault::CoprocessorFault)?;
            math.execute(&mut self.regs, op)?;
            return Ok(Exec::Normal);
        }

        let inst = self
            .mmu
            .fetch_instruction(ctx.mem, ip, self.flags.privileged)?;
        self.regs.ip = ip.wrapping_add(4);

        trace!("core #{}: 0x{:08x}: {}", self.id, ip, inst);

        if let Some(profile) = &mut self.profile {
            *profile.entry(inst.mnemonic()).or_insert(0) += 1;
        }

        self.execute(ctx, inst)
    }

    fn operand(&self, op: Operand) -> u32 {
        match op {
            Operand::Reg(r) => self.regs.get(r),
            Operand::Imm(i) => i as u32,
        }
    }

    fn require_privileged(&self) -> Result<(), Fault> {
        if self.flags.privileged {
            Ok(())
        } else {
            Err(Fault::PrivilegeFault)
        }
    }

    fn set_arith_flags(&mut self, result: u32, overflow: bool) {
        self.flags.zero = result == 0;
        self.flags.sign = result & 0x8000_0000 != 0;
        self.flags.overflow = overflow;
    }

    fn branch_taken(&self, cond: Cond) -> bool {
        let f = &self.flags;
        match cond {
            Cond::Equal => f.equal,
            Cond::NotEqual => !f.equal,
            Cond::Zero => f.zero,
            Cond::NotZero => !f.zero,
            Cond::Greater => !f.sign && !f.equal,
            Cond::GreaterEqual => !f.sign || f.equal,
            Cond::Less => f.sign && !f.equal,
            Cond::LessEqual => f.sign || f.equal,
            Cond::Sign => f.sign,
            Cond::NotSign => !f.sign,
            Cond::Overflow => f.overflow,
            Cond::NotOverflow => !f.overflow,
        }
    }

    /// Resolve a jump target against the already-incremented `ip`.
    fn resolve_target(&self, target: Target) -> Result<u32, Fault> {
        let addr = match target {
            Target::Relative(words) => self.regs.ip.wrapping_add((words as u32).wrapping_mul(4)),
            Target::Absolute(reg) => self.regs.get(reg),
        };
        if addr % 4 != 0 {
            return Err(Fault::UnalignedAccess { addr });
        }
        Ok(addr)
    }

    fn execute(&mut self, ctx: &mut ExecCtx<'_>, inst: Instruction) -> Result<Exec, Fault> {
        use Instruction as I;

        match inst {
            I::Nop => {}

            // -- Data movement ------------------------------------------
            I::Lw { dst, base, offset } => {
                let addr = self.regs.get(base).wrapping_add(offset as u32);
                let value = self.load(ctx, addr, Width::Word)?;
                self.regs.set(dst, value);
            }
            I::Ls { dst, base, offset } => {
                let addr = self.regs.get(base).wrapping_add(offset as u32);
                let value = self.load(ctx, addr, Width::Short)?;
                self.regs.set(dst, value);
            }
            I::Lb { dst, base, offset } => {
                let addr = self.regs.get(base).wrapping_add(offset as u32);
                let value = self.load(ctx, addr, Width::Byte)?;
                self.regs.set(dst, value);
            }
            I::Stw { src, base, offset } => {
                let addr = self.regs.get(base).wrapping_add(offset as u32);
                self.store(ctx, addr, Width::Word, self.regs.get(src))?;
            }
            I::Sts { src, base, offset } => {
                let addr = self.regs.get(base).wrapping_add(offset as u32);
                self.store(ctx, addr, Width::Short, self.regs.get(src))?;
            }
            I::Stb { src, base, offset } => {
                let addr = self.regs.get(base).wrapping_add(offset as u32);
                self.store(ctx, addr, Width::Byte, self.regs.get(src))?;
            }
            I::Cas {
                expected,
                addr,
                replace,
            } => {
                // Single-scheduler machine: the read-compare-write below
                // is atomic by construction.
                let location = self.regs.get(addr);
                let current = self.load(ctx, location, Width::Word)?;
                if current == self.regs.get(expected) {
                    self.store(ctx, location, Width::Word, self.regs.get(replace))?;
                    self.flags.equal = true;
                } else {
                    self.regs.set(expected, current);
                    self.flags.equal = false;
                }
            }
            I::Li { dst, imm } => self.regs.set(dst, imm as u32),
            I::Liu { dst, imm } => {
                let low = self.regs.get(dst) & 0xFFFF;
                self.regs.set(dst, imm << 16 | low);
            }
            I::La { dst, offset } => {
                let addr = self.regs.ip.wrapping_add((offset as u32).wrapping_mul(4));
                self.regs.set(dst, addr);
            }
            I::Mov { dst, src } => {
                let value = self.regs.get(src);
                self.regs.set(dst, value);
            }
            I::Swp { a, b } => {
                let va = self.regs.get(a);
                let vb = self.regs.get(b);
                self.regs.set(a, vb);
                self.regs.set(b, va);
            }

            // -- Arithmetic / logic -------------------------------------
            I::Alu { op, dst, src } => {
                let a = self.regs.get(dst);
                let b = self.operand(src);
                let (result, overflow) = match op {
                    AluOp::Add => {
                        let full = a as u64 + b as u64;
                        (full as u32, full > u32::MAX as u64)
                    }
                    AluOp::Sub => (a.wrapping_sub(b), b > a),
                    AluOp::Mul => {
                        let full = a as u64 * b as u64;
                        (full as u32, full > u32::MAX as u64)
                    }
                    AluOp::Div => {
                        if b == 0 {
                            return Err(Fault::DivisionByZero);
                        }
                        ((a as i32).wrapping_div(b as i32) as u32, false)
                    }
                    AluOp::Mod => {
                        if b == 0 {
                            return Err(Fault::DivisionByZero);
                        }
                        ((a as i32).wrapping_rem(b as i32) as u32, false)
                    }
                    AluOp::And => (a & b, false),
                    AluOp::Or => (a | b, false),
                    AluOp::Xor => (a ^ b, false),
                    AluOp::Shl => (a.checked_shl(b).unwrap_or(0), false),
                    AluOp::Shr => (a.checked_shr(b).unwrap_or(0), false),
                };
                self.regs.set(dst, result);
                self.set_arith_flags(result, overflow);
            }
            I::Inc { reg } => {
                let a = self.regs.get(reg);
                let result = a.wrapping_add(1);
                self.regs.set(reg, result);
                self.set_arith_flags(result, a == u32::MAX);
            }
            I::Dec { reg } => {
                let result = self.regs.get(reg).wrapping_sub(1);
                self.regs.set(reg, result);
                self.set_arith_flags(result, false);
            }
            I::Neg { reg } => {
                let a = self.regs.get(reg);
                let result = a.wrapping_neg();
                self.regs.set(reg, result);
                // i32::MIN has no positive counterpart.
                self.set_arith_flags(result, a == 0x8000_0000);
            }
            I::Not { reg } => {
                let result = !self.regs.get(reg);
                self.regs.set(reg, result);
                self.set_arith_flags(result, false);
            }

            // -- Comparison ---------------------------------------------
            I::Cmp { a, b } => {
                let x = self.regs.get(a);
                let y = self.operand(b);
                self.flags.equal = x == y;
                self.flags.zero = x == y && x == 0;
                self.flags.overflow = false;
                self.flags.sign = (x as i32) < (y as i32);
            }
            I::Cmpu { a, b } => {
                let x = self.regs.get(a);
                let y = self.operand(b);
                self.flags.equal = x == y;
                self.flags.zero = x == y && x == 0;
                self.flags.overflow = false;
                self.flags.sign = x < y;
            }

            // -- Control transfer ---------------------------------------
            I::J { target } => self.regs.ip = self.resolve_target(target)?,
            I::Branch { cond, target } => {
                if self.branch_taken(cond) {
                    self.regs.ip = self.resolve_target(target)?;
                }
            }
            I::Call { target } => {
                let addr = self.resolve_target(target)?;
                self.push_word(ctx, self.regs.ip)?;
                self.push_word(ctx, self.regs.fp)?;
                self.regs.fp = self.regs.sp;
                if self.check_frames {
                    self.frames.push(self.regs.fp);
                }
                self.regs.ip = addr;
            }
            I::Ret => {
                if self.check_frames {
                    match self.frames.pop() {
                        Some(fp) if fp == self.regs.sp => {}
                        frame => {
                            warn!(
                                "core #{}: ret with bad frame: saved={:?}, sp=0x{:08x}",
                                self.id, frame, self.regs.sp
                            );
                            return Err(Fault::AccessViolation {
                                addr: self.regs.sp,
                                kind: AccessKind::Read,
                            });
                        }
                    }
                }
                let fp = self.pop_word(ctx)?;
                let ip = self.pop_word(ctx)?;
                self.regs.fp = fp;
                self.regs.ip = ip;
            }
            I::Int { code } => {
                let irq = self.operand(code);
                self.enter_interrupt(ctx, irq, irq, 0)?;
            }
            I::RetInt => {
                self.require_privileged()?;
                self.exit_interrupt(ctx)?;
            }
            I::Ipi { core, irq } => {
                self.require_privileged()?;
                ctx.ipis
                    .push((self.regs.get(core) as usize, self.regs.get(irq)));
            }

            // -- Stack --------------------------------------------------
            I::Push { src } => {
                let value = self.operand(src);
                self.push_word(ctx, value)?;
            }
            I::Pop { dst } => {
                let value = self.pop_word(ctx)?;
                self.regs.set(dst, value);
            }

            // -- Privileged ---------------------------------------------
            I::Hlt { code } => {
                self.require_privileged()?;
                return Ok(Exec::Halt(self.operand(code)));
            }
            I::Rst => {
                self.require_privileged()?;
                self.reset(0);
            }
            I::Idle => {
                self.require_privileged()?;
                self.flags.halted = true;
            }
            I::Lpt { src } => {
                self.require_privileged()?;
                let base = self.regs.get(src);
                self.mmu.set_pt_base(base);
            }
            I::Lpm { src } => {
                self.require_privileged()?;
                let enabled = self.regs.get(src) & 1 != 0;
                self.mmu.set_pt_enabled(enabled);
            }
            I::Cli => {
                self.require_privileged()?;
                self.flags.hwint_enabled = false;
            }
            I::Sti => {
                self.require_privileged()?;
                self.flags.hwint_enabled = true;
            }
            I::Fptc => {
                self.require_privileged()?;
                self.mmu.flush_tlb();
                self.mmu.flush_icache();
            }
            I::Sis { set } => {
                self.require_privileged()?;
                match set {
                    0 => self.inst_set = 0,
                    1 if self.math.is_some() => self.inst_set = 1,
                    other => return Err(Fault::InvalidOpcode(other)),
                }
            }

            // -- Port I/O -----------------------------------------------
            I::Inb { dst, port } => {
                self.require_privileged()?;
                let port = self.operand(port) as u16;
                let (mut dctx, bus) = ctx.device_ctx();
                let value = bus.io_read(&mut dctx, port)?;
                self.regs.set(dst, value as u32);
            }
            I::Outb { port, src } => {
                self.require_privileged()?;
                let port = self.operand(port) as u16;
                let value = self.regs.get(src) as u8;
                let (mut dctx, bus) = ctx.device_ctx();
                bus.io_write(&mut dctx, port, value)?;
            }
        }

        Ok(Exec::Normal)
    }
}
