//! CIL instruction decoding.
//!
//! Decoding turns a raw code stream into [`Instruction`]s whose operands are already resolved to
//! module handles through a [`TokenSource`]. Relative branch offsets are converted into indices
//! of the target instruction; a branch that lands in the middle of an instruction makes the
//! stream malformed.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotweave::assembly::{decode_stream, NoTokens, OpCode};
//!
//! // nop; br.s +0; ret
//! let code = [0x00, 0x2B, 0x00, 0x2A];
//! let decoded = decode_stream(&code, &NoTokens)?;
//! assert_eq!(decoded.instructions.len(), 3);
//! assert_eq!(decoded.instructions[1].targets(), vec![2]);
//! assert_eq!(decoded.instructions[2].opcode, OpCode::Ret);
//! # Ok::<(), dotweave::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{Instruction, OpCode, Operand, OperandType, FE_PREFIX},
    file::parser::Parser,
    metadata::{token::Token, FieldHandle, MethodHandle, TypeHandle},
    Result,
};

/// Resolves the metadata tokens found in a code stream.
pub trait TokenSource {
    /// Resolve a MethodDef or MemberRef token.
    ///
    /// # Errors
    /// Returns an error if the token does not name a method of the module.
    fn method(&self, token: Token) -> Result<MethodHandle>;

    /// Resolve a Field or MemberRef token.
    ///
    /// # Errors
    /// Returns an error if the token does not name a field of the module.
    fn field(&self, token: Token) -> Result<FieldHandle>;

    /// Resolve a TypeDef, TypeRef or TypeSpec token.
    ///
    /// # Errors
    /// Returns an error if the token does not name a type of the module.
    fn ty(&self, token: Token) -> Result<TypeHandle>;

    /// Resolve a user string token.
    ///
    /// # Errors
    /// Returns an error if the token does not address the user string heap.
    fn string(&self, token: Token) -> Result<String>;
}

/// A [`TokenSource`] for code without token operands.
pub struct NoTokens;

impl TokenSource for NoTokens {
    fn method(&self, token: Token) -> Result<MethodHandle> {
        Err(malformed_error!("Unexpected method token {}", token))
    }

    fn field(&self, token: Token) -> Result<FieldHandle> {
        Err(malformed_error!("Unexpected field token {}", token))
    }

    fn ty(&self, token: Token) -> Result<TypeHandle> {
        Err(malformed_error!("Unexpected type token {}", token))
    }

    fn string(&self, token: Token) -> Result<String> {
        Err(malformed_error!("Unexpected string token {}", token))
    }
}

/// Result of decoding a code stream.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStream {
    /// The instructions in stream order
    pub instructions: Vec<Instruction>,
    /// Byte offset of every instruction, followed by the code length
    pub offsets: Vec<u32>,
}

impl DecodedStream {
    /// Index of the instruction starting at `offset`; the code length maps to one past the end.
    #[must_use]
    pub fn index_of(&self, offset: u32) -> Option<usize> {
        self.offsets.binary_search(&offset).ok()
    }
}

/// Raw operand as read from the stream, before branch resolution.
enum RawOperand {
    Ready(Operand),
    Branch(i64),
    Switch(Vec<i64>),
}

/// Decode a whole code stream.
///
/// # Errors
/// Returns an error for unknown opcodes, truncated operands, unresolvable tokens and branches
/// that do not land on an instruction boundary.
pub fn decode_stream(code: &[u8], source: &dyn TokenSource) -> Result<DecodedStream> {
    let mut parser = Parser::new(code);
    let mut raw = Vec::new();
    let mut offsets = Vec::new();

    while parser.has_more_data() {
        let start = parser.pos();
        let (opcode, operand) = decode_instruction(&mut parser, source)?;
        offsets.push(offset_u32(start)?);
        raw.push((opcode, operand, offset_u32(parser.pos())?));
    }
    offsets.push(offset_u32(code.len())?);

    let index: HashMap<u32, usize> = offsets
        .iter()
        .enumerate()
        .map(|(i, offset)| (*offset, i))
        .collect();
    let resolve = |next: u32, delta: i64| -> Result<usize> {
        let target = i64::from(next) + delta;
        u32::try_from(target)
            .ok()
            .and_then(|t| index.get(&t).copied())
            .filter(|i| *i < raw.len())
            .ok_or_else(|| malformed_error!("Branch target {} is not an instruction boundary", target))
    };

    let mut instructions = Vec::with_capacity(raw.len());
    for (opcode, operand, next) in &raw {
        let operand = match operand {
            RawOperand::Ready(operand) => operand.clone(),
            RawOperand::Branch(delta) => Operand::Branch(resolve(*next, *delta)?),
            RawOperand::Switch(deltas) => Operand::Switch(
                deltas
                    .iter()
                    .map(|delta| resolve(*next, *delta))
                    .collect::<Result<Vec<_>>>()?,
            ),
        };
        instructions.push(Instruction::with(*opcode, operand));
    }

    Ok(DecodedStream {
        instructions,
        offsets,
    })
}

fn offset_u32(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| malformed_error!("Code offset {} too large", offset))
}

fn decode_instruction(parser: &mut Parser, source: &dyn TokenSource) -> Result<(OpCode, RawOperand)> {
    let first_byte = parser.read_le::<u8>()?;
    let value = if first_byte == FE_PREFIX {
        0xFE00 | u16::from(parser.read_le::<u8>()?)
    } else {
        u16::from(first_byte)
    };
    let opcode =
        OpCode::from_value(value).ok_or_else(|| malformed_error!("Invalid opcode: {:04X}", value))?;

    let operand = match opcode.operand_type() {
        OperandType::None => RawOperand::Ready(Operand::None),
        OperandType::ShortInlineI => {
            RawOperand::Ready(Operand::Int32(i32::from(parser.read_le::<i8>()?)))
        }
        OperandType::InlineI => RawOperand::Ready(Operand::Int32(parser.read_le::<i32>()?)),
        OperandType::InlineI8 => RawOperand::Ready(Operand::Int64(parser.read_le::<i64>()?)),
        OperandType::ShortInlineR => RawOperand::Ready(Operand::Float32(parser.read_le::<f32>()?)),
        OperandType::InlineR => RawOperand::Ready(Operand::Float64(parser.read_le::<f64>()?)),
        OperandType::ShortInlineVar => {
            RawOperand::Ready(Operand::Variable(u16::from(parser.read_le::<u8>()?)))
        }
        OperandType::InlineVar => RawOperand::Ready(Operand::Variable(parser.read_le::<u16>()?)),
        OperandType::ShortInlineBrTarget => RawOperand::Branch(i64::from(parser.read_le::<i8>()?)),
        OperandType::InlineBrTarget => RawOperand::Branch(i64::from(parser.read_le::<i32>()?)),
        OperandType::InlineSwitch => {
            let case_count = parser.read_le::<u32>()?;
            if case_count as usize > parser.remaining() / 4 {
                return Err(crate::Error::OutOfBounds);
            }
            let mut targets = Vec::with_capacity(case_count as usize);
            for _ in 0..case_count {
                targets.push(i64::from(parser.read_le::<i32>()?));
            }
            RawOperand::Switch(targets)
        }
        OperandType::InlineMethod => {
            RawOperand::Ready(Operand::Method(source.method(Token::new(parser.read_le::<u32>()?))?))
        }
        OperandType::InlineField => {
            RawOperand::Ready(Operand::Field(source.field(Token::new(parser.read_le::<u32>()?))?))
        }
        OperandType::InlineType | OperandType::InlineTok => {
            RawOperand::Ready(Operand::Type(source.ty(Token::new(parser.read_le::<u32>()?))?))
        }
        OperandType::InlineString => {
            RawOperand::Ready(Operand::String(source.string(Token::new(parser.read_le::<u32>()?))?))
        }
        OperandType::InlineSig => {
            return Err(malformed_error!("Unsupported operand of {}", opcode));
        }
    };

    Ok((opcode, operand))
}
