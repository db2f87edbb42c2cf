//! Native blob execution.
//!
//! A blob is raw Thumb machine code called as
//! `int f(int, int, int, int, int, int, int, int)`. On a bare-metal ARM target
//! [`DirectCall`] jumps into it; everywhere else [`ThumbEmulator`] interprets a
//! Thumb-1 subset so the protocol can be exercised on a host.
//!
//! The emulator checks the cancel flag before every instruction. Real native
//! code gets no such check and has to poll the flag itself.

use crate::protocol::args::MAX_NATIVE_ARGS;
use crate::protocol::frame::Status;
use crate::vm::CancelToken;

/// Runs a loaded blob to completion.
pub trait NativeRunner: Send {
    /// Calls `code` with `args` and returns its `r0`.
    fn invoke(&self, code: &[u8], args: [i32; MAX_NATIVE_ARGS], cancel: &CancelToken) -> Result<i32, Status>;
}

/// Runner suited to the build target.
pub fn default_runner() -> Box<dyn NativeRunner> {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    {
        Box::new(DirectCall)
    }
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    {
        Box::new(ThumbEmulator::default())
    }
}

/// Calls the blob in place with the Thumb bit set.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub struct DirectCall;

#[cfg(all(target_arch = "arm", target_os = "none"))]
impl NativeRunner for DirectCall {
    fn invoke(&self, code: &[u8], args: [i32; MAX_NATIVE_ARGS], _cancel: &CancelToken) -> Result<i32, Status> {
        type Entry = unsafe extern "C" fn(i32, i32, i32, i32, i32, i32, i32, i32) -> i32;

        if code.is_empty() || code.len() % 2 != 0 {
            return Err(Status::Param);
        }
        let addr = code.as_ptr() as usize | 1;
        // SAFETY: the host uploaded this buffer as Thumb code for this exact
        // signature; there is no way to check it and no sandbox around it.
        let entry: Entry = unsafe { std::mem::transmute::<usize, Entry>(addr) };
        let [a0, a1, a2, a3, a4, a5, a6, a7] = args;
        Ok(unsafe { entry(a0, a1, a2, a3, a4, a5, a6, a7) })
    }
}

const SP: usize = 13;
const LR: usize = 14;
const PC: usize = 15;

/// Value placed in LR; branching to it returns from the blob.
const RETURN_ADDRESS: u32 = 0xFFFF_FFFE;
const STACK_BASE: u32 = 0x2000_0000;
const STACK_WORDS: usize = 256;

/// Interpreter for a Thumb-1 subset.
///
/// Supported: shifts by immediate, 3-bit and 8-bit immediate ADD/SUB/MOV/CMP,
/// register ADD/SUB, the sixteen data-processing ops, hi-register ADD/CMP/MOV,
/// BX/BLX, PUSH/POP, SP adjust, conditional and unconditional branches and
/// NOP hints. Anything else fails with [`Status::Exec`].
#[derive(Clone, Copy, Debug)]
pub struct ThumbEmulator {
    /// Instructions executed before giving up with [`Status::Exec`].
    pub max_steps: u64,
}

impl Default for ThumbEmulator {
    fn default() -> Self {
        Self {
            max_steps: 50_000_000,
        }
    }
}

impl NativeRunner for ThumbEmulator {
    fn invoke(&self, code: &[u8], args: [i32; MAX_NATIVE_ARGS], cancel: &CancelToken) -> Result<i32, Status> {
        if code.is_empty() || code.len() % 2 != 0 {
            return Err(Status::Param);
        }
        let mut cpu = Cpu::new(code, args)?;
        for _ in 0..self.max_steps {
            if cancel.is_cancelled() {
                return Err(Status::Timeout);
            }
            if let Some(result) = cpu.step()? {
                return Ok(result as i32);
            }
        }
        Err(Status::Exec)
    }
}

struct Cpu<'a> {
    code: &'a [u8],
    r: [u32; 16],
    n: bool,
    z: bool,
    c: bool,
    v: bool,
    stack: [u32; STACK_WORDS],
}

impl<'a> Cpu<'a> {
    fn new(code: &'a [u8], args: [i32; MAX_NATIVE_ARGS]) -> Result<Self, Status> {
        let mut cpu = Cpu {
            code,
            r: [0; 16],
            n: false,
            z: false,
            c: false,
            v: false,
            stack: [0; STACK_WORDS],
        };
        for (reg, arg) in cpu.r.iter_mut().zip(&args[..4]) {
            *reg = *arg as u32;
        }
        // AAPCS: arguments past r3 live at [sp], [sp + 4], ...
        let top = STACK_BASE + (STACK_WORDS as u32) * 4;
        cpu.r[SP] = top - 4 * (MAX_NATIVE_ARGS as u32 - 4);
        for (i, arg) in args[4..].iter().enumerate() {
            cpu.store(cpu.r[SP] + 4 * i as u32, *arg as u32)?;
        }
        cpu.r[LR] = RETURN_ADDRESS;
        cpu.r[PC] = 0;
        Ok(cpu)
    }

    fn load(&self, addr: u32) -> Result<u32, Status> {
        self.slot(addr).map(|i| self.stack[i])
    }

    fn store(&mut self, addr: u32, value: u32) -> Result<(), Status> {
        let i = self.slot(addr)?;
        self.stack[i] = value;
        Ok(())
    }

    fn slot(&self, addr: u32) -> Result<usize, Status> {
        let offset = addr.checked_sub(STACK_BASE).ok_or(Status::Exec)?;
        let index = (offset / 4) as usize;
        if offset % 4 != 0 || index >= STACK_WORDS {
            return Err(Status::Exec);
        }
        Ok(index)
    }

    fn fetch(&self) -> Result<u16, Status> {
        let pc = self.r[PC] as usize;
        match self.code.get(pc..pc + 2) {
            Some(&[lo, hi]) => Ok(u16::from_le_bytes([lo, hi])),
            _ => Err(Status::Exec),
        }
    }

    /// Moves PC to `target`; returns `Some(r0)` when it is the return address.
    fn branch(&mut self, target: u32) -> Result<Option<u32>, Status> {
        if target & !1 == RETURN_ADDRESS {
            return Ok(Some(self.r[0]));
        }
        let target = target & !1;
        if target as usize >= self.code.len() {
            return Err(Status::Exec);
        }
        self.r[PC] = target;
        Ok(None)
    }

    fn set_nz(&mut self, value: u32) {
        self.n = value & 0x8000_0000 != 0;
        self.z = value == 0;
    }

    /// `a + b + carry`, updating all four flags.
    fn add_flags(&mut self, a: u32, b: u32, carry: bool) -> u32 {
        let wide = a as u64 + b as u64 + carry as u64;
        let result = wide as u32;
        self.set_nz(result);
        self.c = wide > u32::MAX as u64;
        self.v = ((a ^ result) & (b ^ result)) & 0x8000_0000 != 0;
        result
    }

    fn sub_flags(&mut self, a: u32, b: u32) -> u32 {
        self.add_flags(a, !b, true)
    }

    fn condition(&self, cond: u16) -> bool {
        match cond {
            0x0 => self.z,
            0x1 => !self.z,
            0x2 => self.c,
            0x3 => !self.c,
            0x4 => self.n,
            0x5 => !self.n,
            0x6 => self.v,
            0x7 => !self.v,
            0x8 => self.c && !self.z,
            0x9 => !self.c || self.z,
            0xA => self.n == self.v,
            0xB => self.n != self.v,
            0xC => !self.z && self.n == self.v,
            0xD => self.z || self.n != self.v,
            _ => true,
        }
    }

    /// Shift helpers return (result, carry_out); a zero amount keeps carry.
    fn shift(&self, kind: u16, value: u32, amount: u32) -> (u32, bool) {
        match (kind, amount) {
            (_, 0) => (value, self.c),
            (0, 1..=31) => (value << amount, (value >> (32 - amount)) & 1 != 0),
            (0, 32) => (0, value & 1 != 0),
            (0, _) => (0, false),
            (1, 1..=31) => (value >> amount, (value >> (amount - 1)) & 1 != 0),
            (1, 32) => (0, value >> 31 != 0),
            (1, _) => (0, false),
            (2, 1..=31) => (((value as i32) >> amount) as u32, (value >> (amount - 1)) & 1 != 0),
            (2, _) => {
                let fill = ((value as i32) >> 31) as u32;
                (fill, fill != 0)
            }
            (_, _) => {
                let amount = amount % 32;
                if amount == 0 {
                    (value, value >> 31 != 0)
                } else {
                    let out = value.rotate_right(amount);
                    (out, out >> 31 != 0)
                }
            }
        }
    }

    /// Executes one instruction. `Some(r0)` means the blob returned.
    fn step(&mut self) -> Result<Option<u32>, Status> {
        let op = self.fetch()?;
        let pc = self.r[PC];
        self.r[PC] = pc + 2;
        // value of PC as seen by the instruction
        let pc_read = pc + 4;

        let rd = (op & 7) as usize;
        let rs = ((op >> 3) & 7) as usize;

        match op >> 11 {
            // LSL/LSR/ASR #imm5
            0b00000..=0b00010 => {
                let kind = op >> 11;
                let mut amount = ((op >> 6) & 0x1F) as u32;
                if amount == 0 && kind != 0 {
                    amount = 32;
                }
                let (result, carry) = self.shift(kind, self.r[rs], amount);
                self.r[rd] = result;
                self.c = carry;
                self.set_nz(result);
            }
            // ADD/SUB register or imm3
            0b00011 => {
                let operand = if op & 0x0400 != 0 {
                    ((op >> 6) & 7) as u32
                } else {
                    self.r[((op >> 6) & 7) as usize]
                };
                let a = self.r[rs];
                self.r[rd] = if op & 0x0200 != 0 {
                    self.sub_flags(a, operand)
                } else {
                    self.add_flags(a, operand, false)
                };
            }
            // MOV/CMP/ADD/SUB #imm8
            0b00100..=0b00111 => {
                let rdn = ((op >> 8) & 7) as usize;
                let imm = (op & 0xFF) as u32;
                match (op >> 11) & 3 {
                    0 => {
                        self.r[rdn] = imm;
                        self.set_nz(imm);
                    }
                    1 => {
                        self.sub_flags(self.r[rdn], imm);
                    }
                    2 => self.r[rdn] = self.add_flags(self.r[rdn], imm, false),
                    _ => self.r[rdn] = self.sub_flags(self.r[rdn], imm),
                }
            }
            0b01000 if op & 0x0400 == 0 => self.data_processing(op, rd, rs),
            0b01000 => return self.hi_register(op),
            // PUSH / POP / SP adjust / hints
            0b10110 | 0b10111 => return self.misc(op),
            // B<cond>
            0b11010 | 0b11011 => {
                let cond = (op >> 8) & 0xF;
                if cond >= 0xE {
                    return Err(Status::Exec);
                }
                if self.condition(cond) {
                    let offset = ((op & 0xFF) as i8 as i32) << 1;
                    return self.branch(pc_read.wrapping_add(offset as u32));
                }
            }
            // B
            0b11100 => {
                let offset = (((op & 0x7FF) << 5) as i16 >> 4) as i32;
                return self.branch(pc_read.wrapping_add(offset as u32));
            }
            _ => return Err(Status::Exec),
        }
        Ok(None)
    }

    fn data_processing(&mut self, op: u16, rdn: usize, rm: usize) {
        let a = self.r[rdn];
        let b = self.r[rm];
        let result = match (op >> 6) & 0xF {
            0x0 => Some(a & b),
            0x1 => Some(a ^ b),
            kind @ (0x2 | 0x3 | 0x4 | 0x7) => {
                let kind = match kind {
                    0x2 => 0,
                    0x3 => 1,
                    0x4 => 2,
                    _ => 3,
                };
                let (result, carry) = self.shift(kind, a, b & 0xFF);
                self.c = carry;
                Some(result)
            }
            0x5 => Some(self.add_flags(a, b, self.c)),
            0x6 => Some(self.add_flags(a, !b, self.c)),
            0x8 => {
                self.set_nz(a & b);
                None
            }
            0x9 => Some(self.sub_flags(0, b)),
            0xA => {
                self.sub_flags(a, b);
                None
            }
            0xB => {
                self.add_flags(a, b, false);
                None
            }
            0xC => Some(a | b),
            0xD => Some(a.wrapping_mul(b)),
            0xE => Some(a & !b),
            _ => Some(!b),
        };
        if let Some(value) = result {
            self.r[rdn] = value;
            self.set_nz(value);
        }
    }

    fn hi_register(&mut self, op: u16) -> Result<Option<u32>, Status> {
        let rm = ((op >> 3) & 0xF) as usize;
        let rdn = (((op >> 4) & 0x8) | (op & 7)) as usize;
        let read = |cpu: &Self, reg: usize| if reg == PC { cpu.r[PC] + 2 } else { cpu.r[reg] };

        match (op >> 8) & 3 {
            0 => {
                let value = read(self, rdn).wrapping_add(read(self, rm));
                if rdn == PC {
                    return self.branch(value);
                }
                self.r[rdn] = value;
            }
            1 => {
                let (a, b) = (read(self, rdn), read(self, rm));
                self.sub_flags(a, b);
            }
            2 => {
                let value = read(self, rm);
                if rdn == PC {
                    return self.branch(value);
                }
                self.r[rdn] = value;
            }
            _ => {
                let target = read(self, rm);
                if op & 0x80 != 0 {
                    // BLX: link past this instruction
                    self.r[LR] = self.r[PC] | 1;
                }
                return self.branch(target);
            }
        }
        Ok(None)
    }

    fn misc(&mut self, op: u16) -> Result<Option<u32>, Status> {
        let list = op & 0xFF;
        match (op >> 8) & 0xF {
            // ADD/SUB SP, #imm7 * 4
            0x0 => {
                let imm = ((op & 0x7F) as u32) << 2;
                self.r[SP] = if op & 0x80 != 0 {
                    self.r[SP].wrapping_sub(imm)
                } else {
                    self.r[SP].wrapping_add(imm)
                };
            }
            // PUSH {rlist[, LR]}
            0x4 | 0x5 => {
                let with_lr = op & 0x100 != 0;
                let count = list.count_ones() + with_lr as u32;
                let mut addr = self.r[SP].wrapping_sub(4 * count);
                self.r[SP] = addr;
                for reg in (0..8).filter(|i| list & (1 << i) != 0) {
                    self.store(addr, self.r[reg])?;
                    addr += 4;
                }
                if with_lr {
                    self.store(addr, self.r[LR])?;
                }
            }
            // POP {rlist[, PC]}
            0xC | 0xD => {
                let mut addr = self.r[SP];
                for reg in (0..8).filter(|i| list & (1 << i) != 0) {
                    self.r[reg] = self.load(addr)?;
                    addr += 4;
                }
                let target = if op & 0x100 != 0 {
                    let value = self.load(addr)?;
                    addr += 4;
                    Some(value)
                } else {
                    None
                };
                self.r[SP] = addr;
                if let Some(target) = target {
                    return self.branch(target);
                }
            }
            // NOP/YIELD/WFE/WFI/SEV hints; IT blocks are not Thumb-1
            0xF if list & 0x0F == 0 => {}
            _ => return Err(Status::Exec),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(code: &[u16], args: &[i32]) -> Result<i32, Status> {
        let bytes: Vec<u8> = code.iter().flat_map(|op| op.to_le_bytes()).collect();
        let mut padded = [0i32; MAX_NATIVE_ARGS];
        padded[..args.len()].copy_from_slice(args);
        ThumbEmulator::default().invoke(&bytes, padded, &CancelToken::new())
    }

    #[test]
    fn return_42() {
        let blob = [0x2A, 0x20, 0x70, 0x47];
        let result = ThumbEmulator::default().invoke(&blob, [0; 8], &CancelToken::new());
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn adds_first_two_args() {
        // adds r0, r0, r1 ; bx lr
        assert_eq!(run(&[0x1840, 0x4770], &[40, 2]), Ok(42));
        // subs r0, r0, r1
        assert_eq!(run(&[0x1A40, 0x4770], &[40, 2]), Ok(38));
    }

    #[test]
    fn stacked_args_are_reachable() {
        // pop {r0, r1} reads args 4 and 5 ; adds r0, r0, r1 ; bx lr
        assert_eq!(run(&[0xBC03, 0x1840, 0x4770], &[0, 0, 0, 0, 5, 6]), Ok(11));
    }

    #[test]
    fn countdown_loop_with_conditional_branch() {
        // movs r1, #0 ; loop: adds r1, #3 ; subs r0, #1 ; bne loop ; mov r0, r1 ; bx lr
        let code = [0x2100, 0x3103, 0x3801, 0xD1FC, 0x4608, 0x4770];
        assert_eq!(run(&code, &[5]), Ok(15));
    }

    #[test]
    fn push_pop_round_trip_returns_through_pc() {
        // push {r4, lr} ; movs r4, #7 ; muls r0, r4 ; pop {r4, pc}
        let code = [0xB510, 0x2407, 0x4360, 0xBD10];
        assert_eq!(run(&code, &[6]), Ok(42));
    }

    #[test]
    fn alu_and_shift_ops() {
        // lsls r0, r0, #4 ; mvns r1, r1 ; ands r0, r1 ; bx lr
        let code = [0x0100, 0x43C9, 0x4008, 0x4770];
        assert_eq!(run(&code, &[0x0F, 0x10]), Ok(0xE0));
        // negs r0, r0 ; asrs r0, r0, #1 ; bx lr
        assert_eq!(run(&[0x4240, 0x1040, 0x4770], &[8]), Ok(-4));
    }

    #[test]
    fn unconditional_branch_skips() {
        // b +2 (skip next) ; movs r0, #1 ; movs r0, #2 ; bx lr
        let code = [0xE000, 0x2001, 0x2002, 0x4770];
        assert_eq!(run(&code, &[]), Ok(2));
    }

    #[test]
    fn signed_compare_branches() {
        // cmp r0, #0 ; bge +2 ; negs r0, r0 ; nop ; bx lr   (abs)
        let code = [0x2800, 0xDA00, 0x4240, 0xBF00, 0x4770];
        assert_eq!(run(&code, &[-9]), Ok(9));
        assert_eq!(run(&code, &[9]), Ok(9));
    }

    #[test]
    fn invalid_blobs() {
        let cancel = CancelToken::new();
        let emulator = ThumbEmulator::default();
        assert_eq!(emulator.invoke(&[], [0; 8], &cancel), Err(Status::Param));
        assert_eq!(emulator.invoke(&[0x70], [0; 8], &cancel), Err(Status::Param));
        // udf #0
        assert_eq!(run(&[0xDE00], &[]), Err(Status::Exec));
        // running off the end
        assert_eq!(run(&[0x2001], &[]), Err(Status::Exec));
    }

    #[test]
    fn infinite_loop_hits_step_budget_or_cancel() {
        // b . (branch to self)
        let code = 0xE7FEu16.to_le_bytes();
        let emulator = ThumbEmulator { max_steps: 1000 };
        assert_eq!(emulator.invoke(&code, [0; 8], &CancelToken::new()), Err(Status::Exec));

        let cancel = CancelToken::new();
        cancel.cancel();
        assert_eq!(ThumbEmulator::default().invoke(&code, [0; 8], &cancel), Err(Status::Timeout));
    }
}
