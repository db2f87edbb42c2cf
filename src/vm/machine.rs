//! Statement interpreter.
//!
//! A run zeroes the sixteen registers, preloads arguments, builds the
//! statement tables and then steps through statements until `RET`, the end of
//! the table, the wall-clock budget or the cancel flag stops it. Both budget and
//! flag are checked before every statement, so a single long `DELAY` cannot be
//! interrupted. The thread yields after every statement.

use crate::debug;
use crate::protocol::args::{MAX_VM_ARGS, parse_int};
use crate::vm::cancel::CancelToken;
use crate::vm::errors::VmError;
use crate::vm::mailbox::Mailbox;
use crate::vm::pins::{PinMode, Pins};
use crate::vm::program::{Program, VmLimits};
use crate::vm::statement::{Compare, Keyword};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of general-purpose registers.
pub const REGISTER_COUNT: usize = 16;

const MAX_OPERANDS: usize = 8;
const SHIFT_HALF_PERIOD_US: u32 = 1;

/// Why a run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunEnd {
    /// `RET` executed.
    Returned,
    /// Ran past the last statement.
    FellOffEnd,
    /// Wall-clock budget exhausted.
    TimedOut,
    /// Cancel flag observed.
    Cancelled,
}

/// Result of one script run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub value: i32,
    pub end: RunEnd,
    /// Statements executed.
    pub steps: u64,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        matches!(self.end, RunEnd::Returned | RunEnd::FellOffEnd)
    }
}

/// What the loop does after a statement.
enum Flow {
    Next,
    Jump(Option<usize>),
    Return(i32),
}

/// Whitespace/comma separated operands following the keyword.
struct Operands<'a> {
    items: [&'a [u8]; MAX_OPERANDS],
    len: usize,
}

impl<'a> Operands<'a> {
    fn split(text: &'a [u8]) -> Self {
        let mut ops = Operands {
            items: [&[]; MAX_OPERANDS],
            len: 0,
        };
        for token in text
            .split(|b| b.is_ascii_whitespace() || *b == b',')
            .filter(|t| !t.is_empty())
            .take(MAX_OPERANDS)
        {
            ops.items[ops.len] = token;
            ops.len += 1;
        }
        ops
    }

    fn get(&self, index: usize) -> Option<&'a [u8]> {
        (index < self.len).then(|| self.items[index])
    }
}

macro_rules! exec_statement {
    (
        vm = $vm:ident,
        program = $program:ident,
        keyword = $keyword:ident,
        ops = $ops:ident,
        text = $text:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident : $kind:ident ),* $(,)? ) ),* $(,)? }
    ) => {{
        match $keyword {
            $(
                Keyword::$variant => {
                    exec_statement!(@bind $vm, $program, $ops, $text, 0usize; $( $field : $kind ),*);
                    $vm.$handler($( $field ),*)
                }
            )*
        }
    }};

    // binds each operand in turn, leaving the statement on the first missing one
    (@bind $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr; ) => {};
    (@bind $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr;
        $field:ident : $kind:ident $(, $rest:ident : $rest_kind:ident )*
    ) => {
        let Some($field) = exec_statement!(@read $vm, $program, $ops, $text, $slot, $kind) else {
            return Flow::Next;
        };
        exec_statement!(@bind $vm, $program, $ops, $text, $slot + 1; $( $rest : $rest_kind ),*);
    };

    // register index, statement ignored when missing or not a register
    (@read $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr, Reg) => {
        $ops.get($slot).and_then(register_index)
    };
    // evaluated expression, required
    (@read $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr, Expr) => {
        $ops.get($slot).map(|t| $vm.eval(t))
    };
    // evaluated expression, defaults to 0
    (@read $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr, OptExpr) => {
        Some($ops.get($slot).map_or(0, |t| $vm.eval(t)))
    };
    // raw token, required
    (@read $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr, Word) => {
        $ops.get($slot)
    };
    // raw token, optional
    (@read $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr, OptWord) => {
        Some($ops.get($slot))
    };
    // label name resolved to a statement index; unresolved labels become None
    (@read $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr, Label) => {
        $ops.get($slot).map(|t| $program.resolve(t))
    };
    // quoted literal from the raw statement text
    (@read $vm:ident, $program:ident, $ops:ident, $text:ident, $slot:expr, Quoted) => {
        quoted($text)
    };
}

/// Script interpreter instance.
///
/// Owns its registers; the pin bank, mailbox and cancel flag are shared with
/// whoever created it.
pub struct Vm {
    registers: [i32; REGISTER_COUNT],
    limits: VmLimits,
    pins: Arc<dyn Pins>,
    mailbox: Mailbox,
    cancel: CancelToken,
}

impl Vm {
    pub fn new(pins: Arc<dyn Pins>, mailbox: Mailbox, cancel: CancelToken) -> Self {
        Self {
            registers: [0; REGISTER_COUNT],
            limits: VmLimits::default(),
            pins,
            mailbox,
            cancel,
        }
    }

    pub fn with_limits(mut self, limits: VmLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Register file as left by the last run.
    pub fn registers(&self) -> &[i32; REGISTER_COUNT] {
        &self.registers
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Runs `script` with `args` preloaded into `R0..`.
    ///
    /// `timeout_ms == 0` means no budget. Only table overflows are errors;
    /// timeouts and cancellation come back as an unsuccessful [`RunOutcome`].
    pub fn run(&mut self, script: &[u8], args: &[i32], timeout_ms: u32) -> Result<RunOutcome, VmError> {
        self.registers = [0; REGISTER_COUNT];
        for (reg, arg) in self.registers.iter_mut().zip(args.iter().take(MAX_VM_ARGS)) {
            *reg = *arg;
        }

        let program = Program::parse(script, self.limits)?;
        let started = Instant::now();
        let budget = Duration::from_millis(timeout_ms as u64);

        let mut pc = 0;
        let mut value = 0;
        let mut steps = 0u64;
        let end = loop {
            let Some(statement) = program.statement(pc) else {
                break RunEnd::FellOffEnd;
            };
            if timeout_ms != 0 && started.elapsed() > budget {
                break RunEnd::TimedOut;
            }
            if self.cancel.is_cancelled() {
                break RunEnd::Cancelled;
            }

            steps += 1;
            let flow = self.exec(&program, statement);
            std::thread::yield_now();

            match flow {
                Flow::Return(v) => {
                    value = v;
                    break RunEnd::Returned;
                }
                Flow::Jump(Some(target)) if target < program.len() => pc = target,
                Flow::Jump(_) | Flow::Next => pc += 1,
            }
        };

        debug!(
            "script finished: {:?} value={} steps={} lines={} elapsed={:?}",
            end,
            value,
            steps,
            program.len(),
            started.elapsed()
        );

        Ok(RunOutcome { value, end, steps })
    }

    /// Executes one statement; unknown keywords and malformed operands are no-ops.
    fn exec(&mut self, program: &Program<'_>, statement: &[u8]) -> Flow {
        let word_end = statement
            .iter()
            .position(|b| b.is_ascii_whitespace() || *b == b',')
            .unwrap_or(statement.len());
        let Some(keyword) = Keyword::lookup(&statement[..word_end]) else {
            return Flow::Next;
        };
        let text = &statement[word_end..];
        let ops = Operands::split(text);

        exec_statement! {
            vm = self,
            program = program,
            keyword = keyword,
            ops = ops,
            text = text,
            {
                Let => op_let(rd: Reg, value: Expr),
                Add => op_add(rd: Reg, value: Expr),
                Sub => op_sub(rd: Reg, value: Expr),
                Mov => op_mov(rd: Reg, rs: Reg),
                PinMode => op_pin_mode(pin: Expr, mode: Word),
                DWrite => op_dwrite(pin: Expr, value: Expr),
                DRead => op_dread(pin: Expr, rd: Reg),
                AWrite => op_awrite(pin: Expr, value: Expr),
                ARead => op_aread(pin: Expr, rd: Reg),
                ShiftOut => op_shift_out(
                    data: Expr,
                    clock: Expr,
                    latch: Expr,
                    value: Expr,
                    opt1: OptWord,
                    opt2: OptWord,
                ),
                Delay => op_delay(ms: Expr),
                DelayUs => op_delay_us(us: Expr),
                MbClr => op_mb_clr(),
                MbApp => op_mb_app(literal: Quoted),
                Ret => op_ret(value: OptExpr),
                Goto => op_goto(target: Label),
                If => op_if(lhs: Expr, op: Word, rhs: Expr, goto: Word, target: Label),
            }
        }
    }

    /// Register, boolean keyword or integer literal; anything else is 0.
    fn eval(&self, token: &[u8]) -> i32 {
        if let Some(index) = register_index(token) {
            return self.registers[index];
        }
        if token.eq_ignore_ascii_case(b"HIGH") || token.eq_ignore_ascii_case(b"TRUE") {
            return 1;
        }
        if token.eq_ignore_ascii_case(b"LOW") || token.eq_ignore_ascii_case(b"FALSE") {
            return 0;
        }
        parse_int(token)
    }

    fn op_let(&mut self, rd: usize, value: i32) -> Flow {
        self.registers[rd] = value;
        Flow::Next
    }

    fn op_add(&mut self, rd: usize, value: i32) -> Flow {
        self.registers[rd] = self.registers[rd].wrapping_add(value);
        Flow::Next
    }

    fn op_sub(&mut self, rd: usize, value: i32) -> Flow {
        self.registers[rd] = self.registers[rd].wrapping_sub(value);
        Flow::Next
    }

    fn op_mov(&mut self, rd: usize, rs: usize) -> Flow {
        self.registers[rd] = self.registers[rs];
        Flow::Next
    }

    fn op_pin_mode(&mut self, pin: i32, mode: &[u8]) -> Flow {
        self.pins.pin_mode(pin, PinMode::parse(mode));
        Flow::Next
    }

    fn op_dwrite(&mut self, pin: i32, value: i32) -> Flow {
        self.pins.digital_write(pin, value != 0);
        Flow::Next
    }

    fn op_dread(&mut self, pin: i32, rd: usize) -> Flow {
        self.registers[rd] = self.pins.digital_read(pin) as i32;
        Flow::Next
    }

    fn op_awrite(&mut self, pin: i32, value: i32) -> Flow {
        self.pins.analog_write(pin, value);
        Flow::Next
    }

    fn op_aread(&mut self, pin: i32, rd: usize) -> Flow {
        self.registers[rd] = self.pins.analog_read(pin);
        Flow::Next
    }

    fn op_shift_out(
        &mut self,
        data: i32,
        clock: i32,
        latch: i32,
        value: i32,
        opt1: Option<&[u8]>,
        opt2: Option<&[u8]>,
    ) -> Flow {
        let mut bits = 8u32;
        let mut msb_first = true;
        for token in [opt1, opt2].into_iter().flatten() {
            if token.eq_ignore_ascii_case(b"MSBFIRST") {
                msb_first = true;
            } else if token.eq_ignore_ascii_case(b"LSBFIRST") {
                msb_first = false;
            } else {
                bits = self.eval(token).clamp(1, 32) as u32;
            }
        }

        let pins = &self.pins;
        pins.digital_write(latch, false);
        for i in 0..bits {
            let bit = if msb_first { bits - 1 - i } else { i };
            pins.digital_write(data, (value as u32 >> bit) & 1 != 0);
            pins.digital_write(clock, true);
            pins.delay_us(SHIFT_HALF_PERIOD_US);
            pins.digital_write(clock, false);
            pins.delay_us(SHIFT_HALF_PERIOD_US);
        }
        pins.digital_write(latch, true);
        Flow::Next
    }

    fn op_delay(&mut self, ms: i32) -> Flow {
        self.pins.delay_ms(ms.max(0) as u32);
        Flow::Next
    }

    fn op_delay_us(&mut self, us: i32) -> Flow {
        self.pins.delay_us(us.max(0) as u32);
        Flow::Next
    }

    fn op_mb_clr(&mut self) -> Flow {
        self.mailbox.clear();
        Flow::Next
    }

    fn op_mb_app(&mut self, literal: &[u8]) -> Flow {
        self.mailbox.append(literal);
        Flow::Next
    }

    fn op_ret(&mut self, value: i32) -> Flow {
        Flow::Return(value)
    }

    fn op_goto(&mut self, target: Option<usize>) -> Flow {
        Flow::Jump(target)
    }

    fn op_if(&mut self, lhs: i32, op: &[u8], rhs: i32, goto: &[u8], target: Option<usize>) -> Flow {
        if !goto.eq_ignore_ascii_case(b"GOTO") {
            return Flow::Next;
        }
        match Compare::parse(op) {
            Some(cmp) if cmp.holds(lhs, rhs) => Flow::Jump(target),
            _ => Flow::Next,
        }
    }
}

/// `R0`..`R15`, case-insensitive.
fn register_index(token: &[u8]) -> Option<usize> {
    let (prefix, digits) = token.split_first()?;
    if !prefix.eq_ignore_ascii_case(&b'R') || digits.is_empty() || digits.len() > 2 {
        return None;
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let index = digits.iter().fold(0usize, |acc, d| acc * 10 + (d - b'0') as usize);
    (index < REGISTER_COUNT).then_some(index)
}

/// Text between the first `"` and the next one (or the end).
fn quoted(text: &[u8]) -> Option<&[u8]> {
    let open = text.iter().position(|&b| b == b'"')?;
    let body = &text[open + 1..];
    let close = body.iter().position(|&b| b == b'"').unwrap_or(body.len());
    Some(&body[..close])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::pins::{PinEvent, SimPins};

    fn vm_with(pins: Arc<SimPins>, mailbox: usize) -> Vm {
        Vm::new(pins, Mailbox::new(mailbox), CancelToken::new())
    }

    fn vm() -> Vm {
        vm_with(Arc::new(SimPins::new()), 64)
    }

    fn run(src: &str, args: &[i32]) -> RunOutcome {
        vm().run(src.as_bytes(), args, 1000).unwrap()
    }

    #[test]
    fn register_isolation() {
        let outcome = run("LET R0 5; LET R1 R0; RET R1", &[]);
        assert_eq!(outcome.end, RunEnd::Returned);
        assert_eq!(outcome.value, 5);
    }

    #[test]
    fn args_preload_only_leading_registers() {
        let mut vm = vm();
        let outcome = vm.run(b"RET R1", &[7, 9, 11], 0).unwrap();
        assert_eq!(outcome.value, 9);
        assert_eq!(&vm.registers()[..4], &[7, 9, 11, 0]);
        assert!(vm.registers()[3..].iter().all(|r| *r == 0));
    }

    #[test]
    fn args_beyond_sixteen_are_dropped() {
        let args: Vec<i32> = (1..=20).collect();
        let mut vm = vm();
        vm.run(b"", &args, 0).unwrap();
        assert_eq!(vm.registers()[15], 16);
    }

    #[test]
    fn registers_reset_between_runs() {
        let mut vm = vm();
        vm.run(b"LET R5 99", &[], 0).unwrap();
        let outcome = vm.run(b"RET R5", &[], 0).unwrap();
        assert_eq!(outcome.value, 0);
    }

    #[test]
    fn arithmetic_wraps() {
        assert_eq!(run("LET R0 0x7FFFFFFF; ADD R0 1; RET R0", &[]).value, i32::MIN);
        assert_eq!(run("LET R0 3; SUB R0, -4; RET R0", &[]).value, 7);
    }

    #[test]
    fn expressions() {
        assert_eq!(run("LET R2 high; RET R2", &[]).value, 1);
        assert_eq!(run("LET R2 FALSE; RET R2", &[]).value, 0);
        assert_eq!(run("LET R2 -0x10; RET R2", &[]).value, -16);
        assert_eq!(run("LET R2 banana; RET R2", &[]).value, 0);
        assert_eq!(run("let r3 4; mov r4 r3; ret r4", &[]).value, 4);
    }

    #[test]
    fn mov_copies_registers_only() {
        assert_eq!(run("LET R1 9; MOV R2 R1; RET R2", &[]).value, 9);
        // an immediate source is not a register, so the statement is skipped
        assert_eq!(run("LET R1 9; MOV R1 5; RET R1", &[]).value, 9);
        assert_eq!(run("LET R1 9; MOV R1; RET R1", &[]).value, 9);
    }

    #[test]
    fn unknown_statements_are_ignored() {
        let outcome = run("FROB R0 1\nLET R16 4\nLET R0\nRET 3", &[]);
        assert_eq!(outcome.value, 3);
        assert_eq!(outcome.steps, 4);
    }

    #[test]
    fn forward_and_backward_labels() {
        let src = "\
            LET R0 0
            GOTO skip
            RET 99
            SKIP: LET R1 3
            loop: ADD R0 1
            SUB R1 1
            IF R1 > 0 GOTO LOOP
            GOTO nosuch
            end: RET R0";
        let outcome = run(src, &[]);
        assert_eq!(outcome.end, RunEnd::Returned);
        assert_eq!(outcome.value, 3);
    }

    #[test]
    fn trailing_label_falls_through() {
        let outcome = run("LET R0 1\nGOTO end\nLET R0 2\nend:", &[]);
        assert_eq!(outcome.end, RunEnd::FellOffEnd);
        assert_eq!(outcome.value, 0);
        assert!(outcome.success());
    }

    #[test]
    fn if_requires_goto_and_valid_op() {
        assert_eq!(run("IF R0 == 0 JUMP x\nRET 1\nx: RET 2", &[]).value, 1);
        assert_eq!(run("IF R0 =~ 0 GOTO x\nRET 1\nx: RET 2", &[]).value, 1);
        assert_eq!(run("IF R0 <= 0 goto x\nRET 1\nx: RET 2", &[]).value, 2);
    }

    #[test]
    fn timeout_stops_infinite_loop() {
        let started = Instant::now();
        let outcome = vm().run(b"loop: GOTO loop", &[], 50).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.end, RunEnd::TimedOut);
        assert!(!outcome.success());
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn cancel_flag_stops_run() {
        let cancel = CancelToken::new();
        let mut vm = Vm::new(Arc::new(SimPins::new()), Mailbox::new(8), cancel.clone());
        cancel.cancel();
        let outcome = vm.run(b"RET 1", &[], 0).unwrap();
        assert_eq!(outcome.end, RunEnd::Cancelled);
        assert_eq!(outcome.steps, 0);
    }

    #[test]
    fn mailbox_statements() {
        let mut vm = vm_with(Arc::new(SimPins::new()), 8);
        vm.run(b"MBAPP \"abc;def\"; PRINT \"ghij\"", &[], 0).unwrap();
        assert_eq!(vm.mailbox().text(), "abc;def");
        assert_eq!(vm.mailbox().raw()[7], 0);

        vm.run(b"MBCLR; print \"x\"", &[], 0).unwrap();
        assert_eq!(vm.mailbox().text(), "x");
    }

    #[test]
    fn pin_statements() {
        let pins = Arc::new(SimPins::recording());
        pins.inject(7, 1);
        pins.inject(8, 300);
        let mut vm = vm_with(pins.clone(), 8);

        let outcome = vm
            .run(b"PINMODE 13 OUTPUT; DWRITE 13 5; AWRITE 9 R0; DREAD 7 R1; AREAD 8 R2; RET R1", &[128], 0)
            .unwrap();
        assert_eq!(outcome.value, 1);
        assert_eq!(vm.registers()[2], 300);
        assert_eq!(
            pins.take_events(),
            vec![
                PinEvent::Mode(13, PinMode::Output),
                PinEvent::Digital(13, true),
                PinEvent::Analog(9, 128),
            ]
        );
    }

    #[test]
    fn shift_out_frames_latch() {
        let pins = Arc::new(SimPins::recording());
        let mut vm = vm_with(pins.clone(), 8);
        vm.run(b"SHIFTOUT 2 3 4 0b 2 LSBFIRST", &[], 0).unwrap();
        // "0b" is not a number: value 0, two bits, lsb first
        let events = pins.take_events();
        assert_eq!(events.first(), Some(&PinEvent::Digital(4, false)));
        assert_eq!(events.last(), Some(&PinEvent::Digital(4, true)));
        assert_eq!(events.len(), 2 + 2 * 3);

        vm.run(b"SHIFTOUT 2 3 4 0x2", &[], 0).unwrap();
        let data: Vec<bool> = pins
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                PinEvent::Digital(2, level) => Some(level),
                _ => None,
            })
            .collect();
        assert_eq!(data, vec![false, false, false, false, false, false, true, false]);
    }

    #[test]
    fn table_overflow_is_an_error() {
        let mut vm = vm().with_limits(VmLimits {
            max_lines: 1,
            max_labels: 1,
        });
        assert_eq!(vm.run(b"A; B", &[], 0), Err(VmError::TooManyLines { max: 1 }));
    }

    #[test]
    fn register_names() {
        assert_eq!(register_index(b"r15"), Some(15));
        assert_eq!(register_index(b"R0"), Some(0));
        assert_eq!(register_index(b"R16"), None);
        assert_eq!(register_index(b"R"), None);
        assert_eq!(register_index(b"RX"), None);
        assert_eq!(register_index(b"R007"), None);
    }

    #[test]
    fn quoted_literal() {
        assert_eq!(quoted(b" \"hi there\" trailing"), Some(&b"hi there"[..]));
        assert_eq!(quoted(b" \"open"), Some(&b"open"[..]));
        assert_eq!(quoted(b" none"), None);
    }
}
