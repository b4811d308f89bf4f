//! CIL instruction codec and assembler.
//!
//! Instructions are held as [`Instruction`] values whose branch operands are instruction
//! indices rather than byte offsets, so instruction lists can be copied and spliced without
//! re-encoding. Byte offsets only appear at the encode/decode boundary.
//!
//! # Key Types
//! - [`OpCode`] - Every CIL opcode with its encoding, operand kind and flow
//! - [`Instruction`] - An opcode with its operand
//! - [`InstructionAssembler`] - Fluent instruction list construction with labels
//!
//! # Main Functions
//! - [`decode_stream`] - Decode a code stream into instructions
//! - [`encode_stream`] - Encode instructions into a code stream
//!
//! # Example
//! ```rust
//! use dotweave::assembly::{decode_stream, NoTokens, OpCode};
//! let bytecode = &[0x00, 0x2A]; // nop, ret
//! let decoded = decode_stream(bytecode, &NoTokens)?;
//! assert_eq!(decoded.instructions[1].opcode, OpCode::Ret);
//! # Ok::<(), dotweave::Error>(())
//! ```

mod assembler;
mod decoder;
mod encoder;
mod instruction;
mod opcodes;

pub use assembler::{AssembledCode, InstructionAssembler};
pub use decoder::{decode_stream, DecodedStream, NoTokens, TokenSource};
pub use encoder::{encode_stream, EncodedStream, TokenSink};
pub use instruction::{FlowType, Instruction, Operand, OperandType};
pub use opcodes::{OpCode, FE_PREFIX};
