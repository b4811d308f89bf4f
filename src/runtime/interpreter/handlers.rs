//! Instruction semantics.
//!
//! [`step`] executes one instruction against a [`Frame`]. Faults the CLR reports as exceptions
//! (null dereference, failed casts, division by zero, array bounds) become base class library
//! exceptions thrown into the managed code; malformed code is an [`Error::Execution`].

use std::{cmp::Ordering, sync::Arc};

use crate::{
    assembly::{Instruction, OpCode, Operand},
    metadata::model::{FieldHandle, MethodHandle},
    runtime::{
        delegate::{Callable, DelegateValue},
        interpreter::{Completion, Frame, StepResult},
        value::{slot, ArrayValue, Slot, Value},
        Runtime,
    },
    Error, Result,
};

/// Throw a new `System.<name>` from the current instruction.
macro_rules! fault {
    ($runtime:expr, $name:literal, $($arg:tt)*) => {
        return Ok(StepResult::Throw {
            exception: $runtime.new_exception("System", $name, &format!($($arg)*))?,
        })
    };
}

fn malformed(frame: &Frame<'_>, instruction: &Instruction) -> Error {
    Error::Execution(format!(
        "Invalid operand for {} in {}",
        instruction.opcode.mnemonic(),
        frame.def.name
    ))
}

fn slot_at<'s>(slots: &'s [Slot], index: Option<u16>, what: &str) -> Result<&'s Slot> {
    index
        .and_then(|i| slots.get(usize::from(i)))
        .ok_or_else(|| Error::Execution(format!("{what} index {index:?} out of range")))
}

/// Execute `instruction` in `frame`.
pub(crate) fn step(runtime: &Runtime, frame: &mut Frame<'_>, instruction: &Instruction) -> Result<StepResult> {
    use OpCode as Op;

    match instruction.opcode {
        Op::Nop | Op::Break => {}

        Op::Ldarg0 | Op::Ldarg1 | Op::Ldarg2 | Op::Ldarg3 | Op::LdargS | Op::Ldarg => {
            let value = read_lock!(slot_at(&frame.args, instruction.argument_index(), "argument")?).clone();
            frame.push(value);
        }
        Op::LdargaS | Op::Ldarga => {
            let location = Arc::clone(slot_at(&frame.args, instruction.argument_index(), "argument")?);
            frame.push(Value::Ref(location));
        }
        Op::StargS | Op::Starg => {
            let value = frame.pop()?;
            *write_lock!(slot_at(&frame.args, instruction.argument_index(), "argument")?) = value;
        }
        Op::Ldloc0 | Op::Ldloc1 | Op::Ldloc2 | Op::Ldloc3 | Op::LdlocS | Op::Ldloc => {
            let value = read_lock!(slot_at(&frame.locals, instruction.local_index(), "local")?).clone();
            frame.push(value);
        }
        Op::LdlocaS | Op::Ldloca => {
            let location = Arc::clone(slot_at(&frame.locals, instruction.local_index(), "local")?);
            frame.push(Value::Ref(location));
        }
        Op::Stloc0 | Op::Stloc1 | Op::Stloc2 | Op::Stloc3 | Op::StlocS | Op::Stloc => {
            let value = frame.pop()?;
            *write_lock!(slot_at(&frame.locals, instruction.local_index(), "local")?) = value;
        }

        Op::Ldnull => frame.push(Value::Null),
        Op::LdcI4M1
        | Op::LdcI40
        | Op::LdcI41
        | Op::LdcI42
        | Op::LdcI43
        | Op::LdcI44
        | Op::LdcI45
        | Op::LdcI46
        | Op::LdcI47
        | Op::LdcI48
        | Op::LdcI4S
        | Op::LdcI4 => {
            let value = instruction
                .ldc_i4_value()
                .ok_or_else(|| malformed(frame, instruction))?;
            frame.push(Value::I4(value));
        }
        Op::LdcI8 => match instruction.operand {
            Operand::Int64(value) => frame.push(Value::I8(value)),
            _ => return Err(malformed(frame, instruction)),
        },
        Op::LdcR4 => match instruction.operand {
            Operand::Float32(value) => frame.push(Value::R8(f64::from(value))),
            _ => return Err(malformed(frame, instruction)),
        },
        Op::LdcR8 => match instruction.operand {
            Operand::Float64(value) => frame.push(Value::R8(value)),
            _ => return Err(malformed(frame, instruction)),
        },
        Op::Ldstr => match &instruction.operand {
            Operand::String(value) => frame.push(Value::string(value)),
            _ => return Err(malformed(frame, instruction)),
        },

        Op::Dup => {
            let value = frame.pop()?;
            frame.push(value.clone());
            frame.push(value);
        }
        Op::Pop => {
            frame.pop()?;
        }

        Op::Call | Op::Callvirt => {
            let Operand::Method(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            return call(runtime, frame, handle, instruction.opcode == Op::Callvirt);
        }
        Op::Newobj => {
            let Operand::Method(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            return new_object(runtime, frame, handle);
        }
        Op::Ret => {
            let value = if frame.def.signature.ret.is_void() {
                Value::Null
            } else {
                frame.pop()?
            };
            return Ok(StepResult::Return { value });
        }

        Op::Br | Op::BrS => return branch(frame, instruction),
        Op::Brfalse | Op::BrfalseS => {
            if !frame.pop()?.is_true() {
                return branch(frame, instruction);
            }
        }
        Op::Brtrue | Op::BrtrueS => {
            if frame.pop()?.is_true() {
                return branch(frame, instruction);
            }
        }
        Op::Beq
        | Op::BeqS
        | Op::BneUn
        | Op::BneUnS
        | Op::Bge
        | Op::BgeS
        | Op::Bgt
        | Op::BgtS
        | Op::Ble
        | Op::BleS
        | Op::Blt
        | Op::BltS
        | Op::BgeUn
        | Op::BgeUnS
        | Op::BgtUn
        | Op::BgtUnS
        | Op::BleUn
        | Op::BleUnS
        | Op::BltUn
        | Op::BltUnS => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            if conditional(instruction.opcode, &a, &b) {
                return branch(frame, instruction);
            }
        }
        Op::Switch => {
            let Operand::Switch(targets) = &instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let selector = frame.pop()?.as_i4().ok_or_else(|| malformed(frame, instruction))?;
            if let Some(&target) = usize::try_from(selector).ok().and_then(|i| targets.get(i)) {
                return Ok(StepResult::Branch { target });
            }
        }

        Op::LdindI1
        | Op::LdindU1
        | Op::LdindI2
        | Op::LdindU2
        | Op::LdindI4
        | Op::LdindU4
        | Op::LdindI8
        | Op::LdindI
        | Op::LdindR4
        | Op::LdindR8
        | Op::LdindRef
        | Op::Ldobj => {
            let Some(location) = location(frame.pop()?)? else {
                fault!(runtime, "NullReferenceException", "Dereferenced a null pointer");
            };
            let value = read_lock!(location).clone();
            let value = match indirect_conversion(instruction.opcode) {
                Some(conversion) => convert(conversion, &value)?,
                None => value,
            };
            frame.push(value);
        }
        Op::StindRef
        | Op::StindI1
        | Op::StindI2
        | Op::StindI4
        | Op::StindI8
        | Op::StindR4
        | Op::StindR8
        | Op::Stobj => {
            let value = frame.pop()?;
            let Some(location) = location(frame.pop()?)? else {
                fault!(runtime, "NullReferenceException", "Stored through a null pointer");
            };
            let value = match indirect_conversion(instruction.opcode) {
                Some(conversion) => convert(conversion, &value)?,
                None => value,
            };
            *write_lock!(location) = value;
        }
        Op::Cpobj => {
            let source = location(frame.pop()?)?;
            let destination = location(frame.pop()?)?;
            let (Some(source), Some(destination)) = (source, destination) else {
                fault!(runtime, "NullReferenceException", "Copied through a null pointer");
            };
            let value = read_lock!(source).clone();
            *write_lock!(destination) = value;
        }

        Op::Add
        | Op::Sub
        | Op::Mul
        | Op::Div
        | Op::DivUn
        | Op::Rem
        | Op::RemUn
        | Op::And
        | Op::Or
        | Op::Xor
        | Op::Shl
        | Op::Shr
        | Op::ShrUn => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            match arithmetic(instruction.opcode, &a, &b)? {
                Some(value) => frame.push(value),
                None => fault!(runtime, "DivideByZeroException", "Attempted to divide by zero."),
            }
        }
        Op::Neg => {
            let value = match frame.pop()? {
                Value::I4(v) => Value::I4(v.wrapping_neg()),
                Value::I8(v) => Value::I8(v.wrapping_neg()),
                Value::NativeInt(v) => Value::NativeInt(v.wrapping_neg()),
                Value::R8(v) => Value::R8(-v),
                other => return Err(Error::Execution(format!("neg on {}", other.kind()))),
            };
            frame.push(value);
        }
        Op::Not => {
            let value = match frame.pop()? {
                Value::I4(v) => Value::I4(!v),
                Value::I8(v) => Value::I8(!v),
                Value::NativeInt(v) => Value::NativeInt(!v),
                other => return Err(Error::Execution(format!("not on {}", other.kind()))),
            };
            frame.push(value);
        }
        Op::ConvI1
        | Op::ConvI2
        | Op::ConvI4
        | Op::ConvI8
        | Op::ConvR4
        | Op::ConvR8
        | Op::ConvU4
        | Op::ConvU8
        | Op::ConvU2
        | Op::ConvU1
        | Op::ConvI => {
            let value = frame.pop()?;
            frame.push(convert(instruction.opcode, &value)?);
        }

        Op::Ceq => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            frame.push(Value::bool(a.same(&b)));
        }
        Op::Cgt | Op::Clt | Op::CltUn => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            let unsigned = instruction.opcode == Op::CltUn;
            let wanted = if instruction.opcode == Op::Cgt {
                Ordering::Greater
            } else {
                Ordering::Less
            };
            frame.push(Value::bool(compare(&a, &b, unsigned) == Some(wanted)));
        }
        Op::CgtUn => {
            let b = frame.pop()?;
            let a = frame.pop()?;
            // Also the `x != null` idiom on references.
            let result = match compare(&a, &b, true) {
                Some(ordering) => ordering == Ordering::Greater,
                None if is_numeric(&a) => true,
                None => !a.same(&b),
            };
            frame.push(Value::bool(result));
        }

        Op::Castclass | Op::Isinst => {
            let Operand::Type(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let value = frame.pop()?;
            let ty = runtime.resolve_type(frame.assembly(), handle)?;
            if value.is_null() || runtime.is_instance_of(&value, ty)? {
                frame.push(value);
            } else if instruction.opcode == Op::Isinst {
                frame.push(Value::Null);
            } else {
                fault!(
                    runtime,
                    "InvalidCastException",
                    "Unable to cast a {} to {}",
                    value.kind(),
                    runtime.type_name(ty)
                );
            }
        }
        Op::Box => {
            // Boxing is the identity: value type instances already live on the heap.
        }
        Op::Unbox => {
            let value = frame.pop()?;
            if value.is_null() {
                fault!(runtime, "NullReferenceException", "Unboxed a null reference");
            }
            frame.push(Value::Ref(slot(value)));
        }
        Op::UnboxAny => {
            let Operand::Type(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let value = frame.pop()?;
            let ty = runtime.resolve_type(frame.assembly(), handle)?;
            if value.is_null() {
                if runtime.is_value_type(ty)? {
                    fault!(runtime, "NullReferenceException", "Unboxed a null reference");
                }
            } else if !runtime.is_value_type(ty)? && !runtime.is_instance_of(&value, ty)? {
                fault!(
                    runtime,
                    "InvalidCastException",
                    "Unable to cast a {} to {}",
                    value.kind(),
                    runtime.type_name(ty)
                );
            }
            frame.push(value);
        }
        Op::Initobj => {
            let Operand::Type(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let ty = runtime.resolve_type(frame.assembly(), handle)?;
            let Some(location) = location(frame.pop()?)? else {
                fault!(runtime, "NullReferenceException", "Initialized through a null pointer");
            };
            let value = runtime.default_of(ty)?;
            *write_lock!(location) = value;
        }

        Op::Throw => {
            let exception = frame.pop()?;
            if exception.is_null() {
                fault!(runtime, "NullReferenceException", "Threw a null reference");
            }
            return Ok(StepResult::Throw { exception });
        }
        Op::Rethrow => return Ok(StepResult::Rethrow),
        Op::Leave | Op::LeaveS => {
            let Operand::Branch(target) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            return Ok(StepResult::Leave { target });
        }
        Op::Endfinally => return Ok(StepResult::EndFinally),

        Op::Ldfld | Op::Ldflda | Op::Stfld => {
            let Operand::Field(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let value = if instruction.opcode == Op::Stfld {
                Some(frame.pop()?)
            } else {
                None
            };
            let target = frame.pop()?;
            let Some(storage) = field_slot(runtime, frame, handle, target)? else {
                fault!(runtime, "NullReferenceException", "Accessed a field of a null reference");
            };
            match (instruction.opcode, value) {
                (Op::Stfld, Some(value)) => *write_lock!(storage) = value,
                (Op::Ldflda, _) => frame.push(Value::Ref(storage)),
                _ => {
                    let value = read_lock!(storage).clone();
                    frame.push(value);
                }
            }
        }
        Op::Ldsfld | Op::Ldsflda | Op::Stsfld => {
            let Operand::Field(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let field = runtime.resolve_field(frame.assembly(), handle)?;
            let storage = runtime.static_slot(field)?;
            match instruction.opcode {
                Op::Stsfld => {
                    let value = frame.pop()?;
                    *write_lock!(storage) = value;
                }
                Op::Ldsflda => frame.push(Value::Ref(storage)),
                _ => {
                    let value = read_lock!(storage).clone();
                    frame.push(value);
                }
            }
        }

        Op::Newarr => {
            let Operand::Type(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let length = frame.pop()?.as_i8().ok_or_else(|| malformed(frame, instruction))?;
            let Ok(length) = usize::try_from(length) else {
                fault!(runtime, "ArgumentException", "Negative array length {}", length);
            };
            let element = runtime.resolve_type(frame.assembly(), handle)?;
            let items = (0..length)
                .map(|_| runtime.default_of(element).map(slot))
                .collect::<Result<Vec<_>>>()?;
            frame.push(Value::Array(Arc::new(ArrayValue { element, items })));
        }
        Op::Ldlen => match frame.pop()? {
            Value::Array(array) => frame.push(Value::NativeInt(array.items.len() as isize)),
            Value::Null => fault!(runtime, "NullReferenceException", "Length of a null array"),
            other => return Err(Error::Execution(format!("ldlen on {}", other.kind()))),
        },
        Op::Ldelema | Op::LdelemRef | Op::StelemRef => {
            let value = if instruction.opcode == Op::StelemRef {
                Some(frame.pop()?)
            } else {
                None
            };
            let index = frame.pop()?.as_i8().ok_or_else(|| malformed(frame, instruction))?;
            let array = match frame.pop()? {
                Value::Array(array) => array,
                Value::Null => fault!(runtime, "NullReferenceException", "Indexed a null array"),
                other => return Err(Error::Execution(format!("element access on {}", other.kind()))),
            };
            let Some(element) = usize::try_from(index).ok().and_then(|i| array.items.get(i)) else {
                fault!(
                    runtime,
                    "IndexOutOfRangeException",
                    "Index {} was outside the bounds of the array.",
                    index
                );
            };
            match (instruction.opcode, value) {
                (Op::StelemRef, Some(value)) => *write_lock!(element) = value,
                (Op::Ldelema, _) => frame.push(Value::Ref(Arc::clone(element))),
                _ => {
                    let value = read_lock!(element).clone();
                    frame.push(value);
                }
            }
        }

        Op::Ldftn | Op::Ldvirtftn => {
            let Operand::Method(handle) = instruction.operand else {
                return Err(malformed(frame, instruction));
            };
            let mut method = runtime.resolve_method(frame.assembly(), handle)?;
            if instruction.opcode == Op::Ldvirtftn {
                let receiver = frame.pop()?;
                match runtime.type_of(&receiver)? {
                    Some(ty) => method = runtime.resolve_virtual(method, ty)?,
                    None => fault!(runtime, "NullReferenceException", "ldvirtftn on a null reference"),
                }
            }
            frame.push(Value::MethodPtr(method));
        }

        Op::Jmp | Op::Calli | Op::Arglist | Op::Endfilter | Op::Ldtoken | Op::Sizeof => {
            return Err(Error::NotSupported(format!(
                "{} in {}",
                instruction.opcode.mnemonic(),
                runtime.method_name(frame.method)
            )));
        }
    }
    Ok(StepResult::Continue)
}

fn branch(frame: &Frame<'_>, instruction: &Instruction) -> Result<StepResult> {
    match instruction.operand {
        Operand::Branch(target) => Ok(StepResult::Branch { target }),
        _ => Err(malformed(frame, instruction)),
    }
}

fn location(value: Value) -> Result<Option<Slot>> {
    match value {
        Value::Ref(location) => Ok(Some(location)),
        Value::Null => Ok(None),
        other => Err(Error::Execution(format!("Expected a managed pointer, found a {}", other.kind()))),
    }
}

fn field_slot(runtime: &Runtime, frame: &Frame<'_>, handle: FieldHandle, target: Value) -> Result<Option<Slot>> {
    let field = runtime.resolve_field(frame.assembly(), handle)?;
    if runtime.field_def(field)?.is_static() {
        return runtime.static_slot(field).map(Some);
    }
    let target = match target {
        Value::Ref(location) => read_lock!(location).clone(),
        other => other,
    };
    match target {
        Value::Object(object) => object.field(field).map(Some).ok_or_else(|| {
            Error::Execution(format!(
                "{} has no field {}",
                runtime.type_name(object.ty),
                runtime.field_def(field).map_or("?", |f| f.name.as_str())
            ))
        }),
        Value::Null => Ok(None),
        other => Err(Error::Execution(format!("Field access on a {}", other.kind()))),
    }
}

fn call(runtime: &Runtime, frame: &mut Frame<'_>, handle: MethodHandle, virtual_call: bool) -> Result<StepResult> {
    let mut method = runtime.resolve_method(frame.assembly(), handle)?;
    let def = runtime.method_def(method)?;
    let has_this = def.signature.has_this;
    let returns_value = !def.signature.ret.is_void();
    let mut args = frame.pop_n(def.signature.params.len() + usize::from(has_this))?;

    if has_this {
        if let Some(Value::Ref(location)) = args.first() {
            let receiver = read_lock!(location).clone();
            args[0] = receiver;
        }
        if virtual_call {
            match runtime.type_of(&args[0])? {
                Some(ty) => method = runtime.resolve_virtual(method, ty)?,
                None => fault!(
                    runtime,
                    "NullReferenceException",
                    "Called {} on a null reference",
                    runtime.method_name(method)
                ),
            }
        }
    }

    match runtime.call(method, args)? {
        Completion::Return(value) => {
            if returns_value {
                frame.push(value);
            }
            Ok(StepResult::Continue)
        }
        Completion::Throw(exception) => Ok(StepResult::Throw { exception }),
    }
}

fn new_object(runtime: &Runtime, frame: &mut Frame<'_>, handle: MethodHandle) -> Result<StepResult> {
    let ctor = runtime.resolve_method(frame.assembly(), handle)?;
    let ty = ctor.declaring_type();
    let mut args = frame.pop_n(runtime.method_def(ctor)?.signature.params.len())?;

    if runtime.is_delegate_type(ty)? {
        let method = match args.pop() {
            Some(Value::MethodPtr(method)) => method,
            _ => {
                return Err(Error::Execution(format!(
                    "{} constructed without a method pointer",
                    runtime.type_name(ty)
                )))
            }
        };
        let target = args.pop().filter(|target| !target.is_null());
        let delegate = DelegateValue::new(ty, Callable::Method { target, method });
        frame.push(Value::Delegate(Arc::new(delegate)));
        return Ok(StepResult::Continue);
    }

    runtime.ensure_initialized(ty)?;
    let instance = Value::Object(runtime.new_object(ty)?);
    args.insert(0, instance.clone());
    match runtime.call(ctor, args)? {
        Completion::Return(_) => {
            frame.push(instance);
            Ok(StepResult::Continue)
        }
        Completion::Throw(exception) => Ok(StepResult::Throw { exception }),
    }
}

fn is_numeric(value: &Value) -> bool {
    matches!(value, Value::I4(_) | Value::I8(_) | Value::R8(_) | Value::NativeInt(_))
}

fn is_wide(value: &Value) -> bool {
    matches!(value, Value::I8(_) | Value::NativeInt(_))
}

/// Order two numeric values; `None` for non-numeric operands and unordered floats.
fn compare(a: &Value, b: &Value, unsigned: bool) -> Option<Ordering> {
    if !is_numeric(a) || !is_numeric(b) {
        return None;
    }
    if let (Value::R8(_), _) | (_, Value::R8(_)) = (a, b) {
        return as_f64(a)?.partial_cmp(&as_f64(b)?);
    }
    let (x, y) = (a.as_i8()?, b.as_i8()?);
    if !unsigned {
        return Some(x.cmp(&y));
    }
    if is_wide(a) || is_wide(b) {
        Some((x as u64).cmp(&(y as u64)))
    } else {
        Some((x as u32).cmp(&(y as u32)))
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::R8(v) => Some(*v),
        other => other.as_i8().map(|v| v as f64),
    }
}

fn conditional(opcode: OpCode, a: &Value, b: &Value) -> bool {
    use OpCode as Op;

    let unsigned = matches!(
        opcode,
        Op::BgeUn | Op::BgeUnS | Op::BgtUn | Op::BgtUnS | Op::BleUn | Op::BleUnS | Op::BltUn | Op::BltUnS
    );
    let ordering = compare(a, b, unsigned);
    let unordered = ordering.is_none() && unsigned;
    match opcode {
        Op::Beq | Op::BeqS => a.same(b),
        Op::BneUn | Op::BneUnS => !a.same(b),
        Op::Bge | Op::BgeS | Op::BgeUn | Op::BgeUnS => {
            matches!(ordering, Some(Ordering::Greater | Ordering::Equal)) || unordered
        }
        Op::Bgt | Op::BgtS | Op::BgtUn | Op::BgtUnS => ordering == Some(Ordering::Greater) || unordered,
        Op::Ble | Op::BleS | Op::BleUn | Op::BleUnS => {
            matches!(ordering, Some(Ordering::Less | Ordering::Equal)) || unordered
        }
        Op::Blt | Op::BltS | Op::BltUn | Op::BltUnS => ordering == Some(Ordering::Less) || unordered,
        _ => false,
    }
}

/// Binary arithmetic; `Ok(None)` signals an integer division by zero.
fn arithmetic(opcode: OpCode, a: &Value, b: &Value) -> Result<Option<Value>> {
    use OpCode as Op;

    let invalid = || {
        Error::Execution(format!(
            "{} on {} and {}",
            opcode.mnemonic(),
            a.kind(),
            b.kind()
        ))
    };

    if matches!(a, Value::R8(_)) || matches!(b, Value::R8(_)) {
        let (x, y) = (as_f64(a).ok_or_else(invalid)?, as_f64(b).ok_or_else(invalid)?);
        let result = match opcode {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
            Op::Rem => x % y,
            _ => return Err(invalid()),
        };
        return Ok(Some(Value::R8(result)));
    }

    let (x, y) = (a.as_i8().ok_or_else(invalid)?, b.as_i8().ok_or_else(invalid)?);
    let shift = matches!(opcode, Op::Shl | Op::Shr | Op::ShrUn);
    let wide = if shift { is_wide(a) } else { is_wide(a) || is_wide(b) };
    let (ux, uy) = if wide {
        (x as u64, y as u64)
    } else {
        (u64::from(x as u32), u64::from(y as u32))
    };
    let amount = y as u32;

    let result = match opcode {
        Op::Add => x.wrapping_add(y),
        Op::Sub => x.wrapping_sub(y),
        Op::Mul => x.wrapping_mul(y),
        Op::Div | Op::Rem | Op::DivUn | Op::RemUn if y == 0 => return Ok(None),
        Op::Div => x.wrapping_div(y),
        Op::Rem => x.wrapping_rem(y),
        Op::DivUn => (ux / uy) as i64,
        Op::RemUn => (ux % uy) as i64,
        Op::And => x & y,
        Op::Or => x | y,
        Op::Xor => x ^ y,
        Op::Shl => x.wrapping_shl(amount),
        Op::Shr if wide => x.wrapping_shr(amount),
        Op::Shr => i64::from((x as i32).wrapping_shr(amount)),
        Op::ShrUn if wide => ux.wrapping_shr(amount) as i64,
        Op::ShrUn => i64::from((x as u32).wrapping_shr(amount)),
        _ => return Err(invalid()),
    };

    Ok(Some(if !wide {
        Value::I4(result as i32)
    } else if matches!(a, Value::I8(_)) || matches!(b, Value::I8(_)) {
        Value::I8(result)
    } else {
        Value::NativeInt(result as isize)
    }))
}

/// The conversion applied when loading or storing through a typed pointer.
fn indirect_conversion(opcode: OpCode) -> Option<OpCode> {
    use OpCode as Op;

    Some(match opcode {
        Op::LdindI1 | Op::StindI1 => Op::ConvI1,
        Op::LdindU1 => Op::ConvU1,
        Op::LdindI2 | Op::StindI2 => Op::ConvI2,
        Op::LdindU2 => Op::ConvU2,
        Op::LdindI4 | Op::StindI4 => Op::ConvI4,
        Op::LdindU4 => Op::ConvU4,
        Op::LdindI8 | Op::StindI8 => Op::ConvI8,
        Op::LdindI => Op::ConvI,
        Op::LdindR4 | Op::StindR4 => Op::ConvR4,
        Op::LdindR8 | Op::StindR8 => Op::ConvR8,
        _ => return None,
    })
}

fn convert(opcode: OpCode, value: &Value) -> Result<Value> {
    use OpCode as Op;

    let float = as_f64(value);
    let int = match value {
        Value::R8(v) => Some(*v as i64),
        other => other.as_i8(),
    };
    let (Some(int), Some(float)) = (int, float) else {
        return Err(Error::Execution(format!(
            "{} on {}",
            opcode.mnemonic(),
            value.kind()
        )));
    };
    Ok(match opcode {
        Op::ConvI1 => Value::I4(i32::from(int as i8)),
        Op::ConvU1 => Value::I4(i32::from(int as u8)),
        Op::ConvI2 => Value::I4(i32::from(int as i16)),
        Op::ConvU2 => Value::I4(i32::from(int as u16)),
        Op::ConvI4 | Op::ConvU4 => Value::I4(int as i32),
        Op::ConvI8 => Value::I8(int),
        Op::ConvU8 => match value {
            Value::I4(v) => Value::I8(i64::from(*v as u32)),
            _ => Value::I8(int),
        },
        Op::ConvI => Value::NativeInt(int as isize),
        Op::ConvR4 => Value::R8(f64::from(float as f32)),
        Op::ConvR8 => Value::R8(float),
        _ => {
            return Err(Error::Execution(format!(
                "{} is not a conversion",
                opcode.mnemonic()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_wraps_at_width() {
        assert!(matches!(
            arithmetic(OpCode::Add, &Value::I4(i32::MAX), &Value::I4(1)).unwrap(),
            Some(Value::I4(i32::MIN))
        ));
        assert!(matches!(
            arithmetic(OpCode::ShrUn, &Value::I4(-1), &Value::I4(28)).unwrap(),
            Some(Value::I4(15))
        ));
        assert!(matches!(
            arithmetic(OpCode::Mul, &Value::I8(3), &Value::I4(4)).unwrap(),
            Some(Value::I8(12))
        ));
        assert!(arithmetic(OpCode::Div, &Value::I4(1), &Value::I4(0)).unwrap().is_none());
    }

    #[test]
    fn unsigned_comparisons() {
        assert_eq!(compare(&Value::I4(-1), &Value::I4(1), false), Some(Ordering::Less));
        assert_eq!(compare(&Value::I4(-1), &Value::I4(1), true), Some(Ordering::Greater));
        assert!(conditional(OpCode::BgtUnS, &Value::R8(f64::NAN), &Value::R8(0.0)));
        assert!(!conditional(OpCode::BgtS, &Value::R8(f64::NAN), &Value::R8(0.0)));
    }

    #[test]
    fn conversions_truncate_and_extend() {
        assert!(matches!(convert(OpCode::ConvI1, &Value::I4(0x1FF)).unwrap(), Value::I4(-1)));
        assert!(matches!(convert(OpCode::ConvU1, &Value::I4(-1)).unwrap(), Value::I4(255)));
        assert!(matches!(convert(OpCode::ConvU8, &Value::I4(-1)).unwrap(), Value::I8(0xFFFF_FFFF)));
        assert!(matches!(convert(OpCode::ConvI4, &Value::R8(3.9)).unwrap(), Value::I4(3)));
    }
}
