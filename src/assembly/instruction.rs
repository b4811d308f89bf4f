//! Abstract CIL instructions.
//!
//! An [`Instruction`] is an opcode plus a decoded [`Operand`]. Metadata references are held as
//! module handles instead of raw tokens, and branch targets are indices into the owning
//! instruction list, so a method body can be copied or rewritten without touching byte offsets.

use std::fmt;

use crate::{
    assembly::OpCode,
    metadata::{FieldHandle, MethodHandle, TypeHandle},
};

/// Kind of inline operand that follows an opcode in the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand present
    None,
    /// Signed 8-bit integer
    ShortInlineI,
    /// Signed 32-bit integer
    InlineI,
    /// Signed 64-bit integer
    InlineI8,
    /// 32-bit float
    ShortInlineR,
    /// 64-bit float
    InlineR,
    /// 8-bit argument or local index
    ShortInlineVar,
    /// 16-bit argument or local index
    InlineVar,
    /// 8-bit relative branch target
    ShortInlineBrTarget,
    /// 32-bit relative branch target
    InlineBrTarget,
    /// Jump table
    InlineSwitch,
    /// MethodDef, MemberRef or MethodSpec token
    InlineMethod,
    /// Field or MemberRef token
    InlineField,
    /// TypeDef, TypeRef or TypeSpec token
    InlineType,
    /// Any type, method or field token
    InlineTok,
    /// User string token
    InlineString,
    /// StandAloneSig token
    InlineSig,
}

impl OperandType {
    /// Encoded size in bytes, `None` for the variable-size switch table.
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::ShortInlineI
            | OperandType::ShortInlineVar
            | OperandType::ShortInlineBrTarget => Some(1),
            OperandType::InlineVar => Some(2),
            OperandType::InlineI
            | OperandType::ShortInlineR
            | OperandType::InlineBrTarget
            | OperandType::InlineMethod
            | OperandType::InlineField
            | OperandType::InlineType
            | OperandType::InlineTok
            | OperandType::InlineString
            | OperandType::InlineSig => Some(4),
            OperandType::InlineI8 | OperandType::InlineR => Some(8),
            OperandType::InlineSwitch => None,
        }
    }
}

/// Control-flow category of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Normal execution continues to next instruction
    Sequential,
    /// Conditional branch to another location
    ConditionalBranch,
    /// Always branches to another location (unconditional jump)
    UnconditionalBranch,
    /// Call to another method
    Call,
    /// Returns from current method
    Return,
    /// Multi-way branch (switch statement)
    Switch,
    /// Exception throwing
    Throw,
    /// End of finally block
    EndFinally,
    /// Leave protected region (try/catch/finally)
    Leave,
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Integer immediate (`ldc.i4`, `ldc.i4.s`)
    Int32(i32),
    /// 64-bit integer immediate
    Int64(i64),
    /// 32-bit float immediate
    Float32(f32),
    /// 64-bit float immediate
    Float64(f64),
    /// Argument or local index
    Variable(u16),
    /// Index of the target instruction
    Branch(usize),
    /// Indices of the switch targets
    Switch(Vec<usize>),
    /// Method reference
    Method(MethodHandle),
    /// Field reference
    Field(FieldHandle),
    /// Type reference
    Type(TypeHandle),
    /// Literal string
    String(String),
}

/// One CIL instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The opcode
    pub opcode: OpCode,
    /// The operand, shaped according to [`OpCode::operand_type`]
    pub operand: Operand,
}

impl Instruction {
    /// An instruction without operand.
    #[must_use]
    pub fn new(opcode: OpCode) -> Self {
        Instruction {
            opcode,
            operand: Operand::None,
        }
    }

    /// An instruction with operand.
    #[must_use]
    pub fn with(opcode: OpCode, operand: Operand) -> Self {
        Instruction { opcode, operand }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let operand = match (&self.operand, self.opcode.operand_type().size()) {
            (Operand::Switch(targets), None) => 4 + 4 * targets.len(),
            (_, Some(size)) => size,
            (_, None) => 4,
        };
        self.opcode.len() + operand
    }

    /// Branch targets of this instruction, empty for non-branches.
    #[must_use]
    pub fn targets(&self) -> Vec<usize> {
        match &self.operand {
            Operand::Branch(target) => vec![*target],
            Operand::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// `true` if execution can fall through to the next instruction.
    #[must_use]
    pub fn falls_through(&self) -> bool {
        !matches!(
            self.opcode.flow(),
            FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::Leave
        ) && self.opcode != OpCode::Jmp
    }

    /// The argument index addressed by an `ldarg`-family instruction.
    #[must_use]
    pub fn argument_index(&self) -> Option<u16> {
        match self.opcode {
            OpCode::Ldarg0 => Some(0),
            OpCode::Ldarg1 => Some(1),
            OpCode::Ldarg2 => Some(2),
            OpCode::Ldarg3 => Some(3),
            OpCode::LdargS
            | OpCode::Ldarg
            | OpCode::LdargaS
            | OpCode::Ldarga
            | OpCode::StargS
            | OpCode::Starg => match self.operand {
                Operand::Variable(index) => Some(index),
                _ => None,
            },
            _ => None,
        }
    }

    /// The local index addressed by an `ldloc`/`stloc`-family instruction.
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        match self.opcode {
            OpCode::Ldloc0 | OpCode::Stloc0 => Some(0),
            OpCode::Ldloc1 | OpCode::Stloc1 => Some(1),
            OpCode::Ldloc2 | OpCode::Stloc2 => Some(2),
            OpCode::Ldloc3 | OpCode::Stloc3 => Some(3),
            OpCode::LdlocS
            | OpCode::Ldloc
            | OpCode::LdlocaS
            | OpCode::Ldloca
            | OpCode::StlocS
            | OpCode::Stloc => match self.operand {
                Operand::Variable(index) => Some(index),
                _ => None,
            },
            _ => None,
        }
    }

    /// The constant pushed by an `ldc.i4` form.
    #[must_use]
    pub fn ldc_i4_value(&self) -> Option<i32> {
        match self.opcode {
            OpCode::LdcI4M1 => Some(-1),
            OpCode::LdcI40 => Some(0),
            OpCode::LdcI41 => Some(1),
            OpCode::LdcI42 => Some(2),
            OpCode::LdcI43 => Some(3),
            OpCode::LdcI44 => Some(4),
            OpCode::LdcI45 => Some(5),
            OpCode::LdcI46 => Some(6),
            OpCode::LdcI47 => Some(7),
            OpCode::LdcI48 => Some(8),
            OpCode::LdcI4S | OpCode::LdcI4 => match self.operand {
                Operand::Int32(value) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    /// Shortest instruction loading argument `index`.
    #[must_use]
    pub fn ldarg(index: u16) -> Instruction {
        match index {
            0 => Instruction::new(OpCode::Ldarg0),
            1 => Instruction::new(OpCode::Ldarg1),
            2 => Instruction::new(OpCode::Ldarg2),
            3 => Instruction::new(OpCode::Ldarg3),
            i if i <= 0xFF => Instruction::with(OpCode::LdargS, Operand::Variable(i)),
            i => Instruction::with(OpCode::Ldarg, Operand::Variable(i)),
        }
    }

    /// Shortest instruction loading local `index`.
    #[must_use]
    pub fn ldloc(index: u16) -> Instruction {
        match index {
            0 => Instruction::new(OpCode::Ldloc0),
            1 => Instruction::new(OpCode::Ldloc1),
            2 => Instruction::new(OpCode::Ldloc2),
            3 => Instruction::new(OpCode::Ldloc3),
            i if i <= 0xFF => Instruction::with(OpCode::LdlocS, Operand::Variable(i)),
            i => Instruction::with(OpCode::Ldloc, Operand::Variable(i)),
        }
    }

    /// Shortest instruction storing local `index`.
    #[must_use]
    pub fn stloc(index: u16) -> Instruction {
        match index {
            0 => Instruction::new(OpCode::Stloc0),
            1 => Instruction::new(OpCode::Stloc1),
            2 => Instruction::new(OpCode::Stloc2),
            3 => Instruction::new(OpCode::Stloc3),
            i if i <= 0xFF => Instruction::with(OpCode::StlocS, Operand::Variable(i)),
            i => Instruction::with(OpCode::Stloc, Operand::Variable(i)),
        }
    }

    /// Shortest instruction pushing `value`.
    #[must_use]
    pub fn ldc_i4(value: i32) -> Instruction {
        match value {
            -1 => Instruction::new(OpCode::LdcI4M1),
            0 => Instruction::new(OpCode::LdcI40),
            1 => Instruction::new(OpCode::LdcI41),
            2 => Instruction::new(OpCode::LdcI42),
            3 => Instruction::new(OpCode::LdcI43),
            4 => Instruction::new(OpCode::LdcI44),
            5 => Instruction::new(OpCode::LdcI45),
            6 => Instruction::new(OpCode::LdcI46),
            7 => Instruction::new(OpCode::LdcI47),
            8 => Instruction::new(OpCode::LdcI48),
            v if i8::try_from(v).is_ok() => Instruction::with(OpCode::LdcI4S, Operand::Int32(v)),
            v => Instruction::with(OpCode::LdcI4, Operand::Int32(v)),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        match &self.operand {
            Operand::None => Ok(()),
            Operand::Int32(v) => write!(f, " {v}"),
            Operand::Int64(v) => write!(f, " {v}"),
            Operand::Float32(v) => write!(f, " {v}"),
            Operand::Float64(v) => write!(f, " {v}"),
            Operand::Variable(v) => write!(f, " V_{v}"),
            Operand::Branch(t) => write!(f, " IL_{t:04}"),
            Operand::Switch(ts) => {
                let labels: Vec<String> = ts.iter().map(|t| format!("IL_{t:04}")).collect();
                write!(f, " ({})", labels.join(", "))
            }
            Operand::Method(m) => write!(f, " {m:?}"),
            Operand::Field(x) => write!(f, " {x:?}"),
            Operand::Type(t) => write!(f, " {t:?}"),
            Operand::String(s) => write!(f, " {s:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Instruction::new(OpCode::Ret).size(), 1);
        assert_eq!(Instruction::ldc_i4(100).size(), 2);
        assert_eq!(Instruction::ldc_i4(1000).size(), 5);
        assert_eq!(Instruction::with(OpCode::Ldarg, Operand::Variable(300)).size(), 4);
        assert_eq!(
            Instruction::with(OpCode::Switch, Operand::Switch(vec![0, 1, 2])).size(),
            1 + 4 + 12
        );
        assert_eq!(Instruction::new(OpCode::Ceq).size(), 2);
    }

    #[test]
    fn shorthand_selection() {
        assert_eq!(Instruction::ldarg(2).opcode, OpCode::Ldarg2);
        assert_eq!(Instruction::ldarg(9).opcode, OpCode::LdargS);
        assert_eq!(Instruction::ldarg(9).argument_index(), Some(9));
        assert_eq!(Instruction::ldc_i4(-1).ldc_i4_value(), Some(-1));
        assert_eq!(Instruction::ldc_i4(-100).opcode, OpCode::LdcI4S);
        assert_eq!(Instruction::stloc(1).local_index(), Some(1));
    }

    #[test]
    fn flow() {
        assert!(!Instruction::new(OpCode::Ret).falls_through());
        assert!(!Instruction::with(OpCode::BrS, Operand::Branch(0)).falls_through());
        assert!(Instruction::with(OpCode::BrtrueS, Operand::Branch(0)).falls_through());
        assert_eq!(
            Instruction::with(OpCode::BrtrueS, Operand::Branch(4)).targets(),
            vec![4]
        );
    }
}
