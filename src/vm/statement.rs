//! Script keyword table.
//!
//! [`for_each_statement!`](crate::for_each_statement) holds the canonical
//! keyword list and hands it to a callback macro. This module generates the
//! [`Keyword`] enum and the case-insensitive lookup from it; the machine
//! matches on [`Keyword`] to pick a handler.

/// Invokes a callback macro with the complete keyword list.
///
/// Each entry is `Variant => "KEYWORD" | "ALIAS" ...`.
#[macro_export]
macro_rules! for_each_statement {
    ($callback:ident) => {
        $callback! {
            /// LET Rn e ; Rn = e
            Let => "LET",
            /// ADD Rn e ; Rn += e (wrapping)
            Add => "ADD",
            /// SUB Rn e ; Rn -= e (wrapping)
            Sub => "SUB",
            /// MOV Rd Rs ; Rd = Rs
            Mov => "MOV",
            /// PINMODE pin mode ; configure pin direction/pull
            PinMode => "PINMODE",
            /// DWRITE pin e ; drive pin high when e != 0
            DWrite => "DWRITE",
            /// DREAD pin Rn ; Rn = digital level
            DRead => "DREAD",
            /// AWRITE pin e ; analog/PWM write
            AWrite => "AWRITE",
            /// AREAD pin Rn ; Rn = analog reading
            ARead => "AREAD",
            /// SHIFTOUT data clk latch e [bits] [MSBFIRST|LSBFIRST]
            ShiftOut => "SHIFTOUT",
            /// DELAY ms
            Delay => "DELAY",
            /// DELAY_US us
            DelayUs => "DELAY_US",
            /// MBCLR ; empty the mailbox
            MbClr => "MBCLR",
            /// MBAPP "text" ; append to the mailbox
            MbApp => "MBAPP" | "PRINT",
            /// RET e ; stop with result e
            Ret => "RET",
            /// GOTO label
            Goto => "GOTO",
            /// IF Rn op e GOTO label
            If => "IF",
        }
    };
}

macro_rules! define_keywords {
    (@first $first:literal $(| $rest:literal)*) => { $first };

    (
        $(
            $(#[$doc:meta])*
            $name:ident => $($word:literal)|+
        ),* $(,)?
    ) => {
        /// Statement keywords understood by the VM.
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Keyword {
            $(
                $(#[$doc])*
                $name,
            )*
        }

        impl Keyword {
            /// Finds the keyword spelled by `word`, ignoring case.
            pub fn lookup(word: &[u8]) -> Option<Keyword> {
                $(
                    if [$($word),+].iter().any(|w: &&str| w.as_bytes().eq_ignore_ascii_case(word)) {
                        return Some(Keyword::$name);
                    }
                )*
                None
            }

            /// Canonical spelling.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Keyword::$name => define_keywords!(@first $($word)|+), )*
                }
            }
        }
    };
}

for_each_statement!(define_keywords);

/// Comparison operator of an `IF` statement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Compare {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Compare {
    pub fn parse(token: &[u8]) -> Option<Compare> {
        match token {
            b"==" => Some(Compare::Eq),
            b"!=" => Some(Compare::Ne),
            b"<" => Some(Compare::Lt),
            b">" => Some(Compare::Gt),
            b"<=" => Some(Compare::Le),
            b">=" => Some(Compare::Ge),
            _ => None,
        }
    }

    pub fn holds(self, lhs: i32, rhs: i32) -> bool {
        match self {
            Compare::Eq => lhs == rhs,
            Compare::Ne => lhs != rhs,
            Compare::Lt => lhs < rhs,
            Compare::Gt => lhs > rhs,
            Compare::Le => lhs <= rhs,
            Compare::Ge => lhs >= rhs,
        }
    }
}
