//! Method bodies: instructions, locals, exception handlers and sequence points.
//!
//! In memory every position inside a body is an instruction index, which keeps bodies valid
//! when they are copied between methods or when instructions are re-encoded with different
//! sizes. Byte offsets only exist in the encoded form handled by [`encode_body`] and
//! [`decode_body`] (ECMA-335 II.25.4).

use crate::{
    assembly::{encode_stream, decode_stream, Instruction, OpCode, Operand, TokenSink, TokenSource},
    file::{
        io::{read_le, read_le_at},
        writer::Writer,
    },
    metadata::{
        flags::{ExceptionHandlerFlags, MethodBodyFlags, SectionFlags},
        model::{MethodHandle, ModuleDef, TypeHandle},
        signatures::{MethodSig, TypeSig},
        token::Token,
    },
    Error::OutOfBounds,
    Result,
};

/// A protected region with its handler, by instruction index. Ends are exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// First protected instruction
    pub try_start: usize,
    /// One past the last protected instruction
    pub try_end: usize,
    /// First handler instruction
    pub handler_start: usize,
    /// One past the last handler instruction
    pub handler_end: usize,
    /// Caught type for typed clauses
    pub catch_type: Option<TypeHandle>,
    /// First filter instruction for filter clauses
    pub filter_start: Option<usize>,
}

/// Maps an instruction to a source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePoint {
    /// Instruction index
    pub index: usize,
    /// Source document path
    pub document: String,
    /// Start line (1-based)
    pub start_line: u32,
    /// Start column (1-based)
    pub start_column: u32,
    /// End line (1-based)
    pub end_line: u32,
    /// End column (1-based)
    pub end_column: u32,
}

/// A method body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Zero-initialise locals on entry
    pub init_locals: bool,
    /// Local variable types
    pub locals: Vec<TypeSig>,
    /// Instructions
    pub instructions: Vec<Instruction>,
    /// Exception handling clauses
    pub exception_handlers: Vec<ExceptionHandler>,
    /// Debug sequence points, loaded from the symbol file
    pub sequence_points: Vec<SequencePoint>,
}

impl MethodBody {
    /// A body holding `instructions` and nothing else.
    #[must_use]
    pub fn with_instructions(instructions: Vec<Instruction>) -> Self {
        MethodBody {
            instructions,
            ..MethodBody::default()
        }
    }

    /// Check that every index the body holds points at an instruction.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] naming the first dangling index.
    pub fn validate(&self) -> Result<()> {
        let count = self.instructions.len();
        for (index, instruction) in self.instructions.iter().enumerate() {
            if let Some(target) = instruction.targets().into_iter().find(|t| *t >= count) {
                return Err(malformed_error!(
                    "Instruction {} branches to missing instruction {}",
                    index,
                    target
                ));
            }
        }
        for handler in &self.exception_handlers {
            let ordered = handler.try_start < handler.try_end
                && handler.try_end <= count
                && handler.handler_start < handler.handler_end
                && handler.handler_end <= count
                && handler.filter_start.map_or(true, |f| f < count);
            if !ordered {
                return Err(malformed_error!("Exception handler out of range: {:?}", handler));
            }
        }
        if let Some(point) = self.sequence_points.iter().find(|p| p.index >= count) {
            return Err(malformed_error!(
                "Sequence point at missing instruction {}",
                point.index
            ));
        }
        Ok(())
    }

    /// Compute the maximum evaluation stack depth.
    ///
    /// Depths are propagated along every control flow edge; handler entries start with the
    /// exception object on the stack for catch and filter clauses.
    ///
    /// # Errors
    /// Returns an error if a call target in the body cannot be resolved in `module`.
    pub fn compute_max_stack(&self, module: &ModuleDef, returns_value: bool) -> Result<u16> {
        let count = self.instructions.len();
        let mut depth: Vec<Option<u32>> = vec![None; count];
        let mut work = Vec::new();
        let seed = |index: usize, value: u32, depth: &mut Vec<Option<u32>>, work: &mut Vec<usize>| {
            if index < count && depth[index].is_none() {
                depth[index] = Some(value);
                work.push(index);
            }
        };

        seed(0, 0, &mut depth, &mut work);
        for handler in &self.exception_handlers {
            let entry = u32::from(!handler.flags.intersects(
                ExceptionHandlerFlags::FINALLY | ExceptionHandlerFlags::FAULT,
            ));
            seed(handler.handler_start, entry, &mut depth, &mut work);
            if let Some(filter) = handler.filter_start {
                seed(filter, 1, &mut depth, &mut work);
            }
        }

        let mut max = 0u32;
        while let Some(index) = work.pop() {
            let instruction = &self.instructions[index];
            let before = depth[index].unwrap_or(0);
            let (pops, pushes) = stack_effect(instruction, module, returns_value)?;
            let after = before.saturating_sub(pops) + pushes;
            max = max.max(before).max(after);

            let mut successors = instruction.targets();
            if instruction.falls_through() {
                successors.push(index + 1);
            }
            let leaves = matches!(instruction.opcode, OpCode::Leave | OpCode::LeaveS);
            for next in successors {
                seed(next, if leaves { 0 } else { after }, &mut depth, &mut work);
            }
        }

        Ok(u16::try_from(max).unwrap_or(u16::MAX))
    }
}

fn call_effect(sig: &MethodSig, newobj: bool) -> (u32, u32) {
    let args = sig.params.len() as u32;
    if newobj {
        (args, 1)
    } else {
        let pops = args + u32::from(sig.has_this && !sig.explicit_this);
        (pops, u32::from(!sig.ret.is_void()))
    }
}

fn method_effect(module: &ModuleDef, handle: MethodHandle, newobj: bool) -> Result<(u32, u32)> {
    Ok(call_effect(module.method_sig(handle)?, newobj))
}

/// Number of values an instruction pops and pushes.
fn stack_effect(instruction: &Instruction, module: &ModuleDef, returns_value: bool) -> Result<(u32, u32)> {
    use OpCode as O;
    let effect = match instruction.opcode {
        O::Call | O::Callvirt => match instruction.operand {
            Operand::Method(handle) => method_effect(module, handle, false)?,
            _ => (0, 0),
        },
        O::Newobj => match instruction.operand {
            Operand::Method(handle) => method_effect(module, handle, true)?,
            _ => (0, 1),
        },
        O::Ret => (u32::from(returns_value), 0),
        O::Nop | O::Break | O::Br | O::BrS | O::Leave | O::LeaveS | O::Endfinally | O::Jmp => (0, 0),
        O::Ldarg0 | O::Ldarg1 | O::Ldarg2 | O::Ldarg3 | O::LdargS | O::Ldarg | O::LdargaS | O::Ldarga => (0, 1),
        O::Ldloc0 | O::Ldloc1 | O::Ldloc2 | O::Ldloc3 | O::LdlocS | O::Ldloc | O::LdlocaS | O::Ldloca => (0, 1),
        O::Stloc0 | O::Stloc1 | O::Stloc2 | O::Stloc3 | O::StlocS | O::Stloc | O::StargS | O::Starg => (1, 0),
        O::Ldnull | O::LdcI4M1 | O::LdcI40 | O::LdcI41 | O::LdcI42 | O::LdcI43 | O::LdcI44
        | O::LdcI45 | O::LdcI46 | O::LdcI47 | O::LdcI48 | O::LdcI4S | O::LdcI4 | O::LdcI8
        | O::LdcR4 | O::LdcR8 | O::Ldstr | O::Ldsfld | O::Ldsflda | O::Ldftn | O::Ldtoken
        | O::Sizeof | O::Arglist => (0, 1),
        O::Dup => (1, 2),
        O::Pop | O::Brtrue | O::BrtrueS | O::Brfalse | O::BrfalseS | O::Switch | O::Stsfld
        | O::Throw | O::Initobj | O::Endfilter => (1, 0),
        O::Beq | O::BeqS | O::Bge | O::BgeS | O::Bgt | O::BgtS | O::Ble | O::BleS | O::Blt
        | O::BltS | O::BneUn | O::BneUnS | O::BgeUn | O::BgeUnS | O::BgtUn | O::BgtUnS
        | O::BleUn | O::BleUnS | O::BltUn | O::BltUnS | O::Stfld | O::StindRef | O::StindI1
        | O::StindI2 | O::StindI4 | O::StindI8 | O::StindR4 | O::StindR8 | O::Stobj | O::Cpobj => (2, 0),
        O::Add | O::Sub | O::Mul | O::Div | O::DivUn | O::Rem | O::RemUn | O::And | O::Or
        | O::Xor | O::Shl | O::Shr | O::ShrUn | O::Ceq | O::Cgt | O::CgtUn | O::Clt | O::CltUn
        | O::LdelemRef | O::Ldelema => (2, 1),
        O::StelemRef => (3, 0),
        O::Calli => (1, 1),
        O::Rethrow => (0, 0),
        // Everything else replaces the top of the stack.
        _ => (1, 1),
    };
    Ok(effect)
}

/// A body in its encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    /// Header, code and extra sections
    pub bytes: Vec<u8>,
    /// Byte offset of every instruction, followed by the code length
    pub offsets: Vec<u32>,
}

/// Maximum code size of a tiny header.
const TINY_MAX_CODE: usize = 63;
/// Maximum stack depth implied by a tiny header.
const TINY_MAX_STACK: u16 = 8;
/// Size of a fat header in 4-byte units, shifted into place.
const FAT_HEADER_SIZE: u16 = 3 << 12;

/// Encode a body. `locals_token` is the StandAloneSig token of the locals, or null.
///
/// # Errors
/// Returns an error if an instruction cannot be encoded or a handler region is out of range.
pub fn encode_body(body: &MethodBody, locals_token: Token, sink: &mut dyn TokenSink) -> Result<EncodedBody> {
    body.validate()?;
    let stream = encode_stream(&body.instructions, sink)?;
    let code_size = stream.code.len();
    let mut writer = Writer::new();

    let tiny = code_size <= TINY_MAX_CODE
        && body.max_stack <= TINY_MAX_STACK
        && body.locals.is_empty()
        && body.exception_handlers.is_empty()
        && !body.init_locals;

    if tiny {
        writer.write_le::<u8>(((code_size as u8) << 2) | MethodBodyFlags::TINY_FORMAT.bits() as u8);
        writer.write_bytes(&stream.code);
        return Ok(EncodedBody {
            bytes: writer.into_inner(),
            offsets: stream.offsets,
        });
    }

    let mut flags = MethodBodyFlags::FAT_FORMAT;
    if body.init_locals {
        flags |= MethodBodyFlags::INIT_LOCALS;
    }
    if !body.exception_handlers.is_empty() {
        flags |= MethodBodyFlags::MORE_SECTS;
    }
    writer.write_le::<u16>(FAT_HEADER_SIZE | flags.bits());
    writer.write_le::<u16>(body.max_stack);
    writer.write_le::<u32>(
        u32::try_from(code_size).map_err(|_| malformed_error!("Code size {} too large", code_size))?,
    );
    writer.write_le::<u32>(locals_token.value());
    writer.write_bytes(&stream.code);

    if !body.exception_handlers.is_empty() {
        writer.align(4);
        encode_sections(&mut writer, body, &stream.offsets, sink)?;
    }

    Ok(EncodedBody {
        bytes: writer.into_inner(),
        offsets: stream.offsets,
    })
}

fn encode_sections(
    writer: &mut Writer,
    body: &MethodBody,
    offsets: &[u32],
    sink: &mut dyn TokenSink,
) -> Result<()> {
    struct Clause {
        flags: u32,
        try_offset: u32,
        try_length: u32,
        handler_offset: u32,
        handler_length: u32,
        extra: u32,
    }

    let mut clauses = Vec::with_capacity(body.exception_handlers.len());
    for handler in &body.exception_handlers {
        let extra = match (handler.catch_type, handler.filter_start) {
            (_, Some(filter)) => offsets[filter],
            (Some(ty), None) => sink.type_token(ty)?.value(),
            (None, None) => 0,
        };
        clauses.push(Clause {
            flags: u32::from(handler.flags.bits()),
            try_offset: offsets[handler.try_start],
            try_length: offsets[handler.try_end] - offsets[handler.try_start],
            handler_offset: offsets[handler.handler_start],
            handler_length: offsets[handler.handler_end] - offsets[handler.handler_start],
            extra,
        });
    }

    let small = clauses.len() * 12 + 4 <= 0xFF
        && clauses.iter().all(|c| {
            c.try_offset <= 0xFFFF
                && c.try_length <= 0xFF
                && c.handler_offset <= 0xFFFF
                && c.handler_length <= 0xFF
        });

    if small {
        writer.write_le::<u8>(SectionFlags::EHTABLE.bits());
        writer.write_le::<u8>((clauses.len() * 12 + 4) as u8);
        writer.write_le::<u16>(0);
        for clause in &clauses {
            writer.write_le::<u16>(clause.flags as u16);
            writer.write_le::<u16>(clause.try_offset as u16);
            writer.write_le::<u8>(clause.try_length as u8);
            writer.write_le::<u16>(clause.handler_offset as u16);
            writer.write_le::<u8>(clause.handler_length as u8);
            writer.write_le::<u32>(clause.extra);
        }
    } else {
        let size = u32::try_from(clauses.len() * 24 + 4)
            .ok()
            .filter(|s| *s <= 0x00FF_FFFF)
            .ok_or_else(|| malformed_error!("Too many exception handlers"))?;
        writer.write_le::<u32>(u32::from((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits()) | (size << 8));
        for clause in &clauses {
            writer.write_le::<u32>(clause.flags);
            writer.write_le::<u32>(clause.try_offset);
            writer.write_le::<u32>(clause.try_length);
            writer.write_le::<u32>(clause.handler_offset);
            writer.write_le::<u32>(clause.handler_length);
            writer.write_le::<u32>(clause.extra);
        }
    }
    Ok(())
}

/// Resolves StandAloneSig and type tokens while decoding a body header.
pub trait BodySource: TokenSource {
    /// Local types behind a StandAloneSig token.
    ///
    /// # Errors
    /// Returns an error if the token does not name a local variable signature.
    fn locals(&self, token: Token) -> Result<Vec<TypeSig>>;
}

/// A decoded body together with its instruction offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody {
    /// The body, without sequence points
    pub body: MethodBody,
    /// Byte offset of every instruction, followed by the code length
    pub offsets: Vec<u32>,
}

/// Decode the body starting at the beginning of `data`.
///
/// # Errors
/// Returns an error if the header is neither tiny nor fat, the data is truncated, or a handler
/// region does not fall on instruction boundaries.
pub fn decode_body(data: &[u8], source: &dyn BodySource) -> Result<DecodedBody> {
    if data.is_empty() {
        return Err(malformed_error!("Provided data for body parsing is empty"));
    }

    let first_byte = read_le::<u8>(data)?;
    match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011_u8)) {
        MethodBodyFlags::TINY_FORMAT => {
            let size_code = (first_byte >> 2) as usize;
            let code = data.get(1..=size_code).ok_or(OutOfBounds)?;
            let stream = decode_stream(code, source)?;
            Ok(DecodedBody {
                body: MethodBody {
                    max_stack: TINY_MAX_STACK,
                    instructions: stream.instructions,
                    ..MethodBody::default()
                },
                offsets: stream.offsets,
            })
        }
        MethodBodyFlags::FAT_FORMAT => {
            if data.len() < 12 {
                return Err(OutOfBounds);
            }
            let first_duo = read_le::<u16>(data)?;
            let size_header = ((first_duo >> 12) * 4) as usize;
            let flags = MethodBodyFlags::from_bits_truncate(first_duo & 0x0FFF);
            let max_stack = read_le::<u16>(&data[2..])?;
            let size_code = read_le::<u32>(&data[4..])? as usize;
            let locals_token = Token::new(read_le::<u32>(&data[8..])?);
            let code_end = size_header
                .checked_add(size_code)
                .ok_or(OutOfBounds)?;
            let code = data.get(size_header..code_end).ok_or(OutOfBounds)?;
            let stream = decode_stream(code, source)?;

            let locals = if locals_token.is_null() {
                Vec::new()
            } else {
                source.locals(locals_token)?
            };

            let exception_handlers = if flags.contains(MethodBodyFlags::MORE_SECTS) {
                decode_sections(data, (code_end + 3) & !3, &stream, source)?
            } else {
                Vec::new()
            };

            Ok(DecodedBody {
                body: MethodBody {
                    max_stack,
                    init_locals: flags.contains(MethodBodyFlags::INIT_LOCALS),
                    locals,
                    instructions: stream.instructions,
                    exception_handlers,
                    sequence_points: Vec::new(),
                },
                offsets: stream.offsets,
            })
        }
        _ => Err(malformed_error!(
            "MethodHeader is neither FAT nor TINY - {}",
            first_byte
        )),
    }
}

fn decode_sections(
    data: &[u8],
    start: usize,
    stream: &crate::assembly::DecodedStream,
    source: &dyn BodySource,
) -> Result<Vec<ExceptionHandler>> {
    let index = |offset: u32| {
        stream
            .index_of(offset)
            .ok_or_else(|| malformed_error!("Handler offset {} is not an instruction boundary", offset))
    };

    let mut handlers = Vec::new();
    let mut cursor = start;
    loop {
        let section = SectionFlags::from_bits_truncate(*data.get(cursor).ok_or(OutOfBounds)?);
        if !section.contains(SectionFlags::EHTABLE) {
            return Err(malformed_error!("Unsupported method data section {:?}", section));
        }

        let fat = section.contains(SectionFlags::FAT_FORMAT);
        let size = if fat {
            (read_le::<u32>(data.get(cursor..).ok_or(OutOfBounds)?)? >> 8) as usize
        } else {
            *data.get(cursor + 1).ok_or(OutOfBounds)? as usize
        };
        if size < 4 || data.len() < cursor + size {
            return Err(OutOfBounds);
        }
        let clause_size = if fat { 24 } else { 12 };
        let mut at = cursor + 4;
        for _ in 0..(size - 4) / clause_size {
            let (flags, try_offset, try_length, handler_offset, handler_length) = if fat {
                (
                    read_le_at::<u32>(data, &mut at)? as u16,
                    read_le_at::<u32>(data, &mut at)?,
                    read_le_at::<u32>(data, &mut at)?,
                    read_le_at::<u32>(data, &mut at)?,
                    read_le_at::<u32>(data, &mut at)?,
                )
            } else {
                (
                    read_le_at::<u16>(data, &mut at)?,
                    u32::from(read_le_at::<u16>(data, &mut at)?),
                    u32::from(read_le_at::<u8>(data, &mut at)?),
                    u32::from(read_le_at::<u16>(data, &mut at)?),
                    u32::from(read_le_at::<u8>(data, &mut at)?),
                )
            };
            let extra = read_le_at::<u32>(data, &mut at)?;
            let flags = ExceptionHandlerFlags::from_bits_truncate(flags);
            let filter = flags.contains(ExceptionHandlerFlags::FILTER);
            let typed = flags == ExceptionHandlerFlags::EXCEPTION;

            handlers.push(ExceptionHandler {
                flags,
                try_start: index(try_offset)?,
                try_end: index(try_offset + try_length)?,
                handler_start: index(handler_offset)?,
                handler_end: index(handler_offset + handler_length)?,
                catch_type: if typed { Some(source.ty(Token::new(extra))?) } else { None },
                filter_start: if filter { Some(index(extra)?) } else { None },
            });
        }

        if !section.contains(SectionFlags::MORE_SECTS) {
            return Ok(handlers);
        }
        cursor = (cursor + size + 3) & !3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{InstructionAssembler, NoTokens},
        metadata::{FieldHandle, MethodHandle},
    };

    struct Sink;

    impl TokenSink for Sink {
        fn method_token(&mut self, _: MethodHandle) -> Result<Token> {
            Ok(Token::new(0x0A00_0001))
        }
        fn field_token(&mut self, _: FieldHandle) -> Result<Token> {
            Ok(Token::new(0x0400_0001))
        }
        fn type_token(&mut self, _: TypeHandle) -> Result<Token> {
            Ok(Token::new(0x0100_0002))
        }
        fn string_token(&mut self, _: &str) -> Result<Token> {
            Ok(Token::new(0x7000_0001))
        }
    }

    struct Source;

    impl TokenSource for Source {
        fn method(&self, token: Token) -> Result<MethodHandle> {
            NoTokens.method(token)
        }
        fn field(&self, token: Token) -> Result<FieldHandle> {
            NoTokens.field(token)
        }
        fn ty(&self, token: Token) -> Result<TypeHandle> {
            Ok(TypeHandle::Ref(token.row() as usize - 1))
        }
        fn string(&self, token: Token) -> Result<String> {
            NoTokens.string(token)
        }
    }

    impl BodySource for Source {
        fn locals(&self, _token: Token) -> Result<Vec<TypeSig>> {
            Ok(vec![TypeSig::I4])
        }
    }

    #[test]
    fn tiny_round_trip() {
        let body = MethodBody::with_instructions(vec![
            Instruction::new(OpCode::Ldarg0),
            Instruction::new(OpCode::Ret),
        ]);
        let encoded = encode_body(&body, Token::default(), &mut Sink).unwrap();
        assert_eq!(encoded.bytes, vec![0x0A, 0x02, 0x2A]);
        let decoded = decode_body(&encoded.bytes, &Source).unwrap();
        assert_eq!(decoded.body.instructions, body.instructions);
        assert!(decoded.body.locals.is_empty());
    }

    #[test]
    fn fat_body_with_catch_clause() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.label("try")?
            .nop()?
            .leave_s("end")?
            .label("catch")?
            .pop()?
            .leave_s("end")?
            .label("end")?
            .ret()?
            .catch_handler("try", "catch", "catch", "end", TypeHandle::Ref(1))?;
        let code = asm.finish()?;
        let body = MethodBody {
            max_stack: 1,
            init_locals: true,
            locals: vec![TypeSig::I4],
            instructions: code.instructions,
            exception_handlers: code.exception_handlers,
            sequence_points: Vec::new(),
        };

        let encoded = encode_body(&body, Token::new(0x1100_0001), &mut Sink)?;
        assert_eq!(encoded.bytes[0] & 0x3, 0x3);
        assert_eq!(encoded.offsets, vec![0, 1, 3, 4, 6, 7]);

        let decoded = decode_body(&encoded.bytes, &Source)?;
        assert_eq!(decoded.body.locals, vec![TypeSig::I4]);
        assert!(decoded.body.init_locals);
        assert_eq!(decoded.body.exception_handlers, body.exception_handlers);
        Ok(())
    }

    #[test]
    fn validation_rejects_dangling_indices() {
        let mut body = MethodBody::with_instructions(vec![Instruction::with(
            OpCode::BrS,
            Operand::Branch(4),
        )]);
        assert!(body.validate().is_err());
        body.instructions[0] = Instruction::new(OpCode::Ret);
        body.sequence_points.push(SequencePoint {
            index: 3,
            document: "a.cs".into(),
            start_line: 1,
            start_column: 1,
            end_line: 1,
            end_column: 2,
        });
        assert!(body.validate().is_err());
    }

    #[test]
    fn max_stack_follows_branches() {
        let module = ModuleDef::new("Empty");
        let body = MethodBody::with_instructions(vec![
            Instruction::new(OpCode::Ldarg0),
            Instruction::with(OpCode::BrtrueS, Operand::Branch(4)),
            Instruction::new(OpCode::LdcI41),
            Instruction::new(OpCode::Ret),
            Instruction::new(OpCode::LdcI40),
            Instruction::new(OpCode::Dup),
            Instruction::new(OpCode::Pop),
            Instruction::new(OpCode::Ret),
        ]);
        assert_eq!(body.compute_max_stack(&module, true).unwrap(), 2);
    }
}
