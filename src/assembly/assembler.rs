//! Fluent construction of CIL instruction lists.
//!
//! [`InstructionAssembler`] emits [`Instruction`]s with symbolic labels for branch targets and
//! protected regions. Labels may be referenced before they are placed; everything is resolved
//! to instruction indices by [`InstructionAssembler::finish`].
//!
//! ```rust
//! use dotweave::assembly::{InstructionAssembler, OpCode};
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg_0()?
//!     .brtrue_s("set")?
//!     .ldc_i4(0)?
//!     .ret()?
//!     .label("set")?
//!     .ldc_i4(1)?
//!     .ret()?;
//! let body = asm.finish()?;
//! assert_eq!(body.instructions.len(), 6);
//! assert_eq!(body.instructions[1].targets(), vec![4]);
//! # Ok::<(), dotweave::Error>(())
//! ```

use std::collections::HashMap;

use crate::{
    assembly::{Instruction, OpCode, Operand},
    metadata::{
        body::ExceptionHandler, flags::ExceptionHandlerFlags, FieldHandle, MethodHandle,
        TypeHandle,
    },
    Error, Result,
};

/// Output of [`InstructionAssembler::finish`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssembledCode {
    /// Instructions with resolved branch targets
    pub instructions: Vec<Instruction>,
    /// Exception handlers with resolved regions
    pub exception_handlers: Vec<ExceptionHandler>,
}

enum Pending {
    Branch(String),
    Switch(Vec<String>),
}

struct PendingHandler {
    flags: ExceptionHandlerFlags,
    labels: [String; 4],
    catch_type: Option<TypeHandle>,
}

/// Builder for instruction lists.
#[derive(Default)]
pub struct InstructionAssembler {
    instructions: Vec<Instruction>,
    pending: HashMap<usize, Pending>,
    labels: HashMap<String, usize>,
    handlers: Vec<PendingHandler>,
}

macro_rules! simple_ops {
    ($($name:ident => $opcode:ident),* $(,)?) => {
        $(
            #[doc = concat!("Emit `", stringify!($name), "`.")]
            ///
            /// # Errors
            /// Never fails; returns `Result` for chaining.
            pub fn $name(&mut self) -> Result<&mut Self> {
                self.emit(Instruction::new(OpCode::$opcode))
            }
        )*
    };
}

macro_rules! branch_ops {
    ($($name:ident => $opcode:ident),* $(,)?) => {
        $(
            #[doc = concat!("Emit `", stringify!($name), "` to `label`.")]
            ///
            /// # Errors
            /// Never fails; an unknown label is reported by [`InstructionAssembler::finish`].
            pub fn $name(&mut self, label: &str) -> Result<&mut Self> {
                self.branch(OpCode::$opcode, label)
            }
        )*
    };
}

impl InstructionAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions emitted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// `true` if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Append a fully formed instruction.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn emit(&mut self, instruction: Instruction) -> Result<&mut Self> {
        self.instructions.push(instruction);
        Ok(self)
    }

    /// Place `name` at the next instruction.
    ///
    /// # Errors
    /// Returns an error if the label was already placed.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        if self.labels.contains_key(name) {
            return Err(Error::Error(format!("Label '{name}' defined twice")));
        }
        self.labels.insert(name.to_string(), self.instructions.len());
        Ok(self)
    }

    /// Emit a branch `opcode` to `label`.
    ///
    /// # Errors
    /// Never fails; an unknown label is reported by [`InstructionAssembler::finish`].
    pub fn branch(&mut self, opcode: OpCode, label: &str) -> Result<&mut Self> {
        self.pending
            .insert(self.instructions.len(), Pending::Branch(label.to_string()));
        self.emit(Instruction::with(opcode, Operand::Branch(0)))
    }

    /// Emit `switch` over `labels`.
    ///
    /// # Errors
    /// Never fails; unknown labels are reported by [`InstructionAssembler::finish`].
    pub fn switch(&mut self, labels: &[&str]) -> Result<&mut Self> {
        self.pending.insert(
            self.instructions.len(),
            Pending::Switch(labels.iter().map(ToString::to_string).collect()),
        );
        self.emit(Instruction::with(OpCode::Switch, Operand::Switch(Vec::new())))
    }

    /// Declare a catch clause; regions are `[start, end)` label pairs.
    ///
    /// # Errors
    /// Never fails; unknown labels are reported by [`InstructionAssembler::finish`].
    pub fn catch_handler(
        &mut self,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
        catch_type: TypeHandle,
    ) -> Result<&mut Self> {
        self.handlers.push(PendingHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            labels: [try_start, try_end, handler_start, handler_end].map(str::to_string),
            catch_type: Some(catch_type),
        });
        Ok(self)
    }

    /// Declare a finally clause; regions are `[start, end)` label pairs.
    ///
    /// # Errors
    /// Never fails; unknown labels are reported by [`InstructionAssembler::finish`].
    pub fn finally_handler(
        &mut self,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> Result<&mut Self> {
        self.handlers.push(PendingHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            labels: [try_start, try_end, handler_start, handler_end].map(str::to_string),
            catch_type: None,
        });
        Ok(self)
    }

    /// Resolve labels and return the instruction list.
    ///
    /// # Errors
    /// Returns an error if a referenced label was never placed, or a branch label sits past
    /// the last instruction.
    pub fn finish(mut self) -> Result<AssembledCode> {
        let count = self.instructions.len();
        let labels = &self.labels;
        let lookup = |name: &str, allow_end: bool| -> Result<usize> {
            match labels.get(name) {
                Some(&index) if index < count || (allow_end && index == count) => Ok(index),
                Some(_) => Err(Error::Error(format!("Label '{name}' has no instruction"))),
                None => Err(Error::Error(format!("Undefined label '{name}'"))),
            }
        };

        for (index, pending) in &self.pending {
            self.instructions[*index].operand = match pending {
                Pending::Branch(label) => Operand::Branch(lookup(label, false)?),
                Pending::Switch(targets) => Operand::Switch(
                    targets
                        .iter()
                        .map(|label| lookup(label, false))
                        .collect::<Result<Vec<_>>>()?,
                ),
            };
        }

        let mut exception_handlers = Vec::with_capacity(self.handlers.len());
        for handler in &self.handlers {
            exception_handlers.push(ExceptionHandler {
                flags: handler.flags,
                try_start: lookup(&handler.labels[0], false)?,
                try_end: lookup(&handler.labels[1], true)?,
                handler_start: lookup(&handler.labels[2], false)?,
                handler_end: lookup(&handler.labels[3], true)?,
                catch_type: handler.catch_type,
                filter_start: None,
            });
        }

        Ok(AssembledCode {
            instructions: self.instructions,
            exception_handlers,
        })
    }

    simple_ops! {
        nop => Nop,
        ldarg_0 => Ldarg0,
        ldarg_1 => Ldarg1,
        ldarg_2 => Ldarg2,
        ldarg_3 => Ldarg3,
        ldloc_0 => Ldloc0,
        ldloc_1 => Ldloc1,
        stloc_0 => Stloc0,
        stloc_1 => Stloc1,
        ldnull => Ldnull,
        dup => Dup,
        pop => Pop,
        ret => Ret,
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        rem => Rem,
        and => And,
        or => Or,
        xor => Xor,
        neg => Neg,
        ceq => Ceq,
        cgt => Cgt,
        clt => Clt,
        conv_i4 => ConvI4,
        ldind_i4 => LdindI4,
        stind_i4 => StindI4,
        ldind_ref => LdindRef,
        stind_ref => StindRef,
        throw => Throw,
        rethrow => Rethrow,
        endfinally => Endfinally,
    }

    branch_ops! {
        br => Br,
        br_s => BrS,
        brtrue => Brtrue,
        brtrue_s => BrtrueS,
        brfalse => Brfalse,
        brfalse_s => BrfalseS,
        beq_s => BeqS,
        bne_un_s => BneUnS,
        bge_s => BgeS,
        bgt_s => BgtS,
        ble_s => BleS,
        blt_s => BltS,
        leave => Leave,
        leave_s => LeaveS,
    }

    /// Emit the shortest load of argument `index`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::ldarg(index))
    }

    /// Emit the shortest load of the address of argument `index`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldarga(&mut self, index: u16) -> Result<&mut Self> {
        let opcode = if index <= 0xFF { OpCode::LdargaS } else { OpCode::Ldarga };
        self.emit(Instruction::with(opcode, Operand::Variable(index)))
    }

    /// Emit the shortest store to argument `index`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn starg(&mut self, index: u16) -> Result<&mut Self> {
        let opcode = if index <= 0xFF { OpCode::StargS } else { OpCode::Starg };
        self.emit(Instruction::with(opcode, Operand::Variable(index)))
    }

    /// Emit the shortest load of local `index`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::ldloc(index))
    }

    /// Emit the shortest store to local `index`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(Instruction::stloc(index))
    }

    /// Emit the shortest load of the address of local `index`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldloca(&mut self, index: u16) -> Result<&mut Self> {
        let opcode = if index <= 0xFF { OpCode::LdlocaS } else { OpCode::Ldloca };
        self.emit(Instruction::with(opcode, Operand::Variable(index)))
    }

    /// Emit the shortest `ldc.i4` form for `value`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.emit(Instruction::ldc_i4(value))
    }

    /// Emit `ldc.i8`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::LdcI8, Operand::Int64(value)))
    }

    /// Emit `ldstr`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldstr(&mut self, value: &str) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Ldstr, Operand::String(value.to_string())))
    }

    /// Emit `call`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn call(&mut self, method: MethodHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Call, Operand::Method(method)))
    }

    /// Emit `callvirt`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn callvirt(&mut self, method: MethodHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Callvirt, Operand::Method(method)))
    }

    /// Emit `newobj`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn newobj(&mut self, ctor: MethodHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Newobj, Operand::Method(ctor)))
    }

    /// Emit `ldftn`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldftn(&mut self, method: MethodHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Ldftn, Operand::Method(method)))
    }

    /// Emit `ldfld`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldfld(&mut self, field: FieldHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Ldfld, Operand::Field(field)))
    }

    /// Emit `ldflda`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldflda(&mut self, field: FieldHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Ldflda, Operand::Field(field)))
    }

    /// Emit `stfld`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn stfld(&mut self, field: FieldHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Stfld, Operand::Field(field)))
    }

    /// Emit `ldsfld`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn ldsfld(&mut self, field: FieldHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Ldsfld, Operand::Field(field)))
    }

    /// Emit `stsfld`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn stsfld(&mut self, field: FieldHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Stsfld, Operand::Field(field)))
    }

    /// Emit `box`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn box_value(&mut self, ty: TypeHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Box, Operand::Type(ty)))
    }

    /// Emit `unbox.any`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn unbox_any(&mut self, ty: TypeHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::UnboxAny, Operand::Type(ty)))
    }

    /// Emit `initobj`.
    ///
    /// # Errors
    /// Never fails; returns `Result` for chaining.
    pub fn initobj(&mut self, ty: TypeHandle) -> Result<&mut Self> {
        self.emit(Instruction::with(OpCode::Initobj, Operand::Type(ty)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_backward_labels() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.label("top")?
            .ldarg_0()?
            .brfalse_s("done")?
            .br_s("top")?
            .label("done")?
            .ret()?;
        let code = asm.finish()?;
        assert_eq!(code.instructions[1].operand, Operand::Branch(3));
        assert_eq!(code.instructions[2].operand, Operand::Branch(0));
        Ok(())
    }

    #[test]
    fn protected_regions_resolve() -> Result<()> {
        let mut asm = InstructionAssembler::new();
        asm.label("try")?
            .nop()?
            .leave_s("end")?
            .label("finally")?
            .endfinally()?
            .label("end")?
            .ret()?
            .finally_handler("try", "finally", "finally", "end")?;
        let code = asm.finish()?;
        let handler = &code.exception_handlers[0];
        assert_eq!((handler.try_start, handler.try_end), (0, 2));
        assert_eq!((handler.handler_start, handler.handler_end), (2, 3));
        assert!(handler.flags.contains(ExceptionHandlerFlags::FINALLY));
        Ok(())
    }

    #[test]
    fn unresolved_labels_fail() {
        let mut asm = InstructionAssembler::new();
        asm.br("nowhere").unwrap();
        assert!(asm.finish().is_err());

        let mut asm = InstructionAssembler::new();
        asm.ret().unwrap().label("end").unwrap();
        asm.br_s("end").unwrap();
        // "end" now labels the branch itself, which is legal
        assert!(asm.finish().is_ok());

        let mut asm = InstructionAssembler::new();
        asm.label("a").unwrap();
        assert!(asm.label("a").is_err());
    }
}
