//! CIL instruction encoding.
//!
//! The encoder lays out an instruction list, turning branch indices back into relative byte
//! offsets. Short branches whose displacement does not fit a signed byte are widened to their
//! long form and the layout is recomputed until it is stable, so callers may always emit the
//! short forms.

use crate::{
    assembly::{Instruction, OpCode, Operand, OperandType},
    file::writer::Writer,
    metadata::{token::Token, FieldHandle, MethodHandle, TypeHandle},
    Result,
};

/// Provides the metadata tokens for the handles found in instruction operands.
pub trait TokenSink {
    /// Token of a method handle.
    ///
    /// # Errors
    /// Returns an error if the handle is dangling.
    fn method_token(&mut self, handle: MethodHandle) -> Result<Token>;

    /// Token of a field handle.
    ///
    /// # Errors
    /// Returns an error if the handle is dangling.
    fn field_token(&mut self, handle: FieldHandle) -> Result<Token>;

    /// Token of a type handle.
    ///
    /// # Errors
    /// Returns an error if the handle is dangling.
    fn type_token(&mut self, handle: TypeHandle) -> Result<Token>;

    /// Token of a user string, interning it on first use.
    ///
    /// # Errors
    /// Returns an error if the user string heap overflows.
    fn string_token(&mut self, value: &str) -> Result<Token>;
}

/// Result of encoding an instruction list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedStream {
    /// The code bytes
    pub code: Vec<u8>,
    /// Byte offset of every instruction, followed by the code length
    pub offsets: Vec<u32>,
}

/// Encode an instruction list.
///
/// # Errors
/// Returns an error for operands that do not match their opcode, branch indices outside the
/// list, or tokens the sink cannot provide.
pub fn encode_stream(instructions: &[Instruction], sink: &mut dyn TokenSink) -> Result<EncodedStream> {
    let mut opcodes: Vec<OpCode> = instructions.iter().map(|i| i.opcode).collect();
    let offsets = loop {
        let offsets = layout(instructions, &opcodes)?;
        let mut widened = false;
        for (index, instruction) in instructions.iter().enumerate() {
            if opcodes[index].operand_type() != OperandType::ShortInlineBrTarget {
                continue;
            }
            if let Operand::Branch(target) = instruction.operand {
                let delta = displacement(&offsets, index, target)?;
                if i8::try_from(delta).is_err() {
                    opcodes[index] = opcodes[index].long_form();
                    widened = true;
                }
            }
        }
        if !widened {
            break offsets;
        }
    };

    let mut writer = Writer::new();
    for (index, instruction) in instructions.iter().enumerate() {
        let opcode = opcodes[index];
        let value = opcode.value();
        if opcode.len() == 2 {
            writer.write_le::<u16>(value.swap_bytes());
        } else {
            writer.write_le::<u8>(value as u8);
        }
        write_operand(&mut writer, opcode, instruction, index, &offsets, sink)?;
    }

    Ok(EncodedStream {
        code: writer.into_inner(),
        offsets,
    })
}

fn layout(instructions: &[Instruction], opcodes: &[OpCode]) -> Result<Vec<u32>> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut position = 0u32;
    for (instruction, opcode) in instructions.iter().zip(opcodes) {
        offsets.push(position);
        let sized = Instruction::with(*opcode, Operand::None);
        let operand = match (&instruction.operand, opcode.operand_type()) {
            (Operand::Switch(targets), OperandType::InlineSwitch) => 4 + 4 * targets.len(),
            _ => sized.size() - opcode.len(),
        };
        let size = u32::try_from(opcode.len() + operand)
            .map_err(|_| malformed_error!("Instruction too large"))?;
        position = position
            .checked_add(size)
            .ok_or_else(|| malformed_error!("Code stream too large"))?;
    }
    offsets.push(position);
    Ok(offsets)
}

fn displacement(offsets: &[u32], index: usize, target: usize) -> Result<i64> {
    if target + 1 >= offsets.len() {
        return Err(malformed_error!(
            "Branch at {} targets missing instruction {}",
            index,
            target
        ));
    }
    Ok(i64::from(offsets[target]) - i64::from(offsets[index + 1]))
}

fn write_operand(
    writer: &mut Writer,
    opcode: OpCode,
    instruction: &Instruction,
    index: usize,
    offsets: &[u32],
    sink: &mut dyn TokenSink,
) -> Result<()> {
    let mismatch = || {
        malformed_error!(
            "Operand {:?} does not fit {}",
            instruction.operand,
            opcode
        )
    };
    match (opcode.operand_type(), &instruction.operand) {
        (OperandType::None, Operand::None) => {}
        (OperandType::ShortInlineI, Operand::Int32(value)) => {
            writer.write_le::<i8>(i8::try_from(*value).map_err(|_| mismatch())?);
        }
        (OperandType::InlineI, Operand::Int32(value)) => writer.write_le::<i32>(*value),
        (OperandType::InlineI8, Operand::Int64(value)) => writer.write_le::<i64>(*value),
        (OperandType::ShortInlineR, Operand::Float32(value)) => writer.write_le::<f32>(*value),
        (OperandType::InlineR, Operand::Float64(value)) => writer.write_le::<f64>(*value),
        (OperandType::ShortInlineVar, Operand::Variable(value)) => {
            writer.write_le::<u8>(u8::try_from(*value).map_err(|_| mismatch())?);
        }
        (OperandType::InlineVar, Operand::Variable(value)) => writer.write_le::<u16>(*value),
        (OperandType::ShortInlineBrTarget, Operand::Branch(target)) => {
            let delta = displacement(offsets, index, *target)?;
            writer.write_le::<i8>(i8::try_from(delta).map_err(|_| mismatch())?);
        }
        (OperandType::InlineBrTarget, Operand::Branch(target)) => {
            let delta = displacement(offsets, index, *target)?;
            writer.write_le::<i32>(i32::try_from(delta).map_err(|_| mismatch())?);
        }
        (OperandType::InlineSwitch, Operand::Switch(targets)) => {
            writer.write_le::<u32>(u32::try_from(targets.len()).map_err(|_| mismatch())?);
            for target in targets {
                let delta = displacement(offsets, index, *target)?;
                writer.write_le::<i32>(i32::try_from(delta).map_err(|_| mismatch())?);
            }
        }
        (OperandType::InlineMethod, Operand::Method(handle)) => {
            writer.write_le::<u32>(sink.method_token(*handle)?.value());
        }
        (OperandType::InlineField, Operand::Field(handle)) => {
            writer.write_le::<u32>(sink.field_token(*handle)?.value());
        }
        (OperandType::InlineType | OperandType::InlineTok, Operand::Type(handle)) => {
            writer.write_le::<u32>(sink.type_token(*handle)?.value());
        }
        (OperandType::InlineString, Operand::String(value)) => {
            writer.write_le::<u32>(sink.string_token(value)?.value());
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::{decode_stream, NoTokens};

    struct Strings(Vec<String>);

    impl TokenSink for Strings {
        fn method_token(&mut self, _handle: MethodHandle) -> Result<Token> {
            Ok(Token::new(0x0600_0001))
        }

        fn field_token(&mut self, _handle: FieldHandle) -> Result<Token> {
            Ok(Token::new(0x0400_0001))
        }

        fn type_token(&mut self, _handle: TypeHandle) -> Result<Token> {
            Ok(Token::new(0x0100_0001))
        }

        fn string_token(&mut self, value: &str) -> Result<Token> {
            self.0.push(value.to_string());
            Ok(Token::new(0x7000_0000 | self.0.len() as u32))
        }
    }

    #[test]
    fn encode_simple_stream() {
        let instructions = vec![
            Instruction::with(OpCode::Ldstr, Operand::String("x".into())),
            Instruction::with(OpCode::BrtrueS, Operand::Branch(3)),
            Instruction::new(OpCode::Nop),
            Instruction::new(OpCode::Ret),
        ];
        let mut sink = Strings(Vec::new());
        let encoded = encode_stream(&instructions, &mut sink).unwrap();
        assert_eq!(encoded.code, vec![0x72, 0x01, 0x00, 0x00, 0x70, 0x2D, 0x01, 0x00, 0x2A]);
        assert_eq!(encoded.offsets, vec![0, 5, 7, 8, 9]);
        assert_eq!(sink.0, vec!["x".to_string()]);
    }

    #[test]
    fn short_branches_widen_when_far() {
        let mut instructions = vec![Instruction::with(OpCode::BrS, Operand::Branch(201))];
        instructions.extend((0..200).map(|_| Instruction::new(OpCode::Nop)));
        instructions.push(Instruction::new(OpCode::Ret));

        let encoded = encode_stream(&instructions, &mut Strings(Vec::new())).unwrap();
        assert_eq!(encoded.code[0], OpCode::Br.value() as u8);
        assert_eq!(&encoded.code[1..5], &200i32.to_le_bytes());

        let decoded = decode_stream(&encoded.code, &NoTokens).unwrap();
        assert_eq!(decoded.instructions[0].operand, Operand::Branch(201));
    }

    #[test]
    fn two_byte_opcodes_and_mismatches() {
        let encoded = encode_stream(
            &[Instruction::new(OpCode::Ceq), Instruction::new(OpCode::Ret)],
            &mut Strings(Vec::new()),
        )
        .unwrap();
        assert_eq!(encoded.code, vec![0xFE, 0x01, 0x2A]);

        let bad = [Instruction::with(OpCode::Ldarg0, Operand::Int32(1))];
        assert!(encode_stream(&bad, &mut Strings(Vec::new())).is_err());
        let dangling = [Instruction::with(OpCode::BrS, Operand::Branch(7))];
        assert!(encode_stream(&dangling, &mut Strings(Vec::new())).is_err());
    }
}
