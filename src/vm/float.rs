//! The floating point engine.
//!
//! Reals on the frame stack are IEEE-754 doubles split into four 16-bit
//! words, bottom word pushed first. The sub-function byte selects the
//! operation in its low six bits; the two high bits request promotion of
//! popped integer operands to reals, which is how mixed integer/real
//! expressions reach the engine.

use super::{Machine, Trap};
use crate::insn::fp;

type Result<T> = core::result::Result<T, Trap>;

impl Machine {
    /// Execute a `float` sub-function.
    pub(crate) fn exec_float(&mut self, fun: u8) -> Result<()> {
        let operation = fun & fp::OP_MASK;
        match operation {
            fp::FLOAT => {
                let value = self.pop()? as i16;
                self.push_f64(value.into())
            }
            fp::TRUNC => {
                let value = self.pop_operand(fun & fp::INT1 != 0)?;
                self.push_integer(value.trunc())
            }
            fp::ROUND => {
                let value = self.pop_operand(fun & fp::INT1 != 0)?;
                self.push_integer(value.round())
            }
            fp::ADD | fp::SUB | fp::MUL | fp::DIV => {
                let b = self.pop_operand(fun & fp::INT1 != 0)?;
                let a = self.pop_operand(fun & fp::INT2 != 0)?;
                let result = match operation {
                    fp::ADD => a + b,
                    fp::SUB => a - b,
                    fp::MUL => a * b,
                    _ => a / b,
                };
                self.push_f64(result)
            }
            fp::EQU | fp::NEQ | fp::LT | fp::GTE | fp::GT | fp::LTE => {
                let b = self.pop_operand(fun & fp::INT1 != 0)?;
                let a = self.pop_operand(fun & fp::INT2 != 0)?;
                let result = match operation {
                    fp::EQU => a == b,
                    fp::NEQ => a != b,
                    fp::LT => a < b,
                    fp::GTE => a >= b,
                    fp::GT => a > b,
                    _ => a <= b,
                };
                self.push(result as u16)
            }
            fp::NEG
            | fp::ABS
            | fp::SQR
            | fp::SQRT
            | fp::SIN
            | fp::COS
            | fp::ATAN
            | fp::LN
            | fp::EXP => {
                let value = self.pop_operand(fun & fp::INT1 != 0)?;
                let result = match operation {
                    fp::NEG => -value,
                    fp::ABS => value.abs(),
                    fp::SQR => value * value,
                    fp::SQRT => value.sqrt(),
                    fp::SIN => value.sin(),
                    fp::COS => value.cos(),
                    fp::ATAN => value.atan(),
                    fp::LN => value.ln(),
                    _ => value.exp(),
                };
                self.push_f64(result)
            }
            // `mod` is defined by the instruction set but has never been
            // supported by the engine.
            _ => Err(Trap::BadFpOpcode),
        }
    }

    /// Pop one operand, promoting a 16-bit integer when requested.
    fn pop_operand(&mut self, promote: bool) -> Result<f64> {
        if promote {
            let value = self.pop()? as i16;
            Ok(value.into())
        } else {
            self.pop_f64()
        }
    }

    /// Push a real converted to a 16-bit integer, trapping out-of-range values.
    fn push_integer(&mut self, value: f64) -> Result<()> {
        if !value.is_finite() || value < i16::MIN.into() || value > i16::MAX.into() {
            return Err(Trap::IntOverflow);
        }
        self.push(value as i16 as u16)
    }
}
