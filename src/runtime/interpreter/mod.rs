//! The CIL interpreter.
//!
//! Every managed call runs in its own [`Frame`] on the host stack: arguments and locals are
//! [`Slot`]s, the evaluation stack is a plain vector. [`handlers::step`] executes a single
//! instruction and reports a [`StepResult`]; the execution loop applies it and drives
//! exception handling.
//!
//! # Exception handling
//!
//! A thrown exception is matched against the clauses protecting the throwing instruction in
//! table order, which lists inner clauses first. Finally and fault clauses met before the
//! matching catch run first, innermost outwards, and control then enters the catch handler
//! with the exception on the stack. Without a matching catch the finally clauses run and the
//! exception propagates to the caller as [`Completion::Throw`]. `leave` runs the finally
//! clauses of every protected region it exits before jumping. Filter clauses are not
//! evaluated and never match.

mod handlers;

use std::cell::Cell;

use crate::{
    corlib::EXCEPTION_MESSAGE_FIELD,
    metadata::{
        body::{ExceptionHandler, MethodBody},
        flags::ExceptionHandlerFlags,
        model::{MethodDef, MethodId},
    },
    runtime::{
        intrinsics,
        value::{slot, Object, Slot, Value},
        Runtime, RuntimeMethodId, RuntimeTypeId,
    },
    Error, Result,
};

/// Deepest managed call nesting before execution is aborted.
pub const MAX_CALL_DEPTH: usize = 128;

thread_local! {
    static CALL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// How a managed call ended.
#[derive(Debug, Clone)]
pub enum Completion {
    /// Normal return with the return value, `Null` for `void`
    Return(Value),
    /// An exception escaped the method
    Throw(Value),
}

/// Result of executing a single instruction.
#[derive(Debug)]
pub(crate) enum StepResult {
    /// Continue with the next instruction
    Continue,
    /// Jump to an instruction index
    Branch {
        /// Target instruction
        target: usize,
    },
    /// Return from the method
    Return {
        /// Return value, `Null` for `void`
        value: Value,
    },
    /// Raise an exception
    Throw {
        /// The exception object
        exception: Value,
    },
    /// Raise the exception of the innermost active catch handler again
    Rethrow,
    /// Exit protected regions towards `target`
    Leave {
        /// Target instruction
        target: usize,
    },
    /// End of a finally or fault handler
    EndFinally,
}

/// Activation record of one managed call.
pub(crate) struct Frame<'a> {
    pub(crate) method: RuntimeMethodId,
    pub(crate) def: &'a MethodDef,
    pub(crate) args: Vec<Slot>,
    pub(crate) locals: Vec<Slot>,
    pub(crate) stack: Vec<Value>,
}

impl Frame<'_> {
    pub(crate) fn assembly(&self) -> usize {
        self.method.assembly
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| {
            Error::Execution(format!("Evaluation stack underflow in {}", self.def.name))
        })
    }

    /// Pop `count` values, returned in push order.
    pub(crate) fn pop_n(&mut self, count: usize) -> Result<Vec<Value>> {
        if self.stack.len() < count {
            return Err(Error::Execution(format!(
                "Evaluation stack underflow in {}",
                self.def.name
            )));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }
}

/// Work still to do before execution resumes normally.
enum Pending {
    /// Finally clauses to run, then continue at `target`
    Leave {
        target: usize,
        finallys: Vec<usize>,
        running: Option<usize>,
    },
    /// Finally and fault clauses to run, then enter `catch` or propagate `exception`
    Unwind {
        exception: Value,
        finallys: Vec<usize>,
        catch: Option<usize>,
        running: Option<usize>,
    },
}

impl Pending {
    fn running(&self) -> Option<usize> {
        match self {
            Pending::Leave { running, .. } | Pending::Unwind { running, .. } => *running,
        }
    }
}

/// Where the interpreter goes after a non-local transfer.
enum Resume {
    At(usize),
    Propagate(Value),
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Result<DepthGuard> {
        CALL_DEPTH.with(|depth| {
            if depth.get() >= MAX_CALL_DEPTH {
                return Err(Error::RecursionLimit(MAX_CALL_DEPTH));
            }
            depth.set(depth.get() + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn protects(clause: &ExceptionHandler, pc: usize) -> bool {
    clause.try_start <= pc && pc < clause.try_end
}

fn in_handler(clause: &ExceptionHandler, pc: usize) -> bool {
    clause.handler_start <= pc && pc < clause.handler_end
}

fn is_cleanup(clause: &ExceptionHandler) -> bool {
    clause.flags.contains(ExceptionHandlerFlags::FINALLY) || clause.flags.contains(ExceptionHandlerFlags::FAULT)
}

impl Runtime {
    /// Call `method` with `args`, the receiver first for instance methods.
    ///
    /// Methods with a body are interpreted. Runtime-implemented delegate members and
    /// `internalcall` base library members are dispatched natively.
    ///
    /// # Errors
    /// Returns an error if the method cannot be executed; managed exceptions are reported as
    /// [`Completion::Throw`].
    pub fn call(&self, method: RuntimeMethodId, args: Vec<Value>) -> Result<Completion> {
        let _depth = DepthGuard::enter()?;
        let def = self.method_def(method)?;
        let expected = def.signature.params.len() + usize::from(def.signature.has_this);
        if args.len() != expected {
            return Err(Error::Execution(format!(
                "{} takes {} argument(s), {} given",
                self.method_name(method),
                expected,
                args.len()
            )));
        }
        if def.is_static() || def.is_constructor() {
            self.ensure_initialized(method.declaring_type())?;
        }

        if let Some(body) = &def.body {
            return self.execute(method, def, body, args);
        }
        if def.impl_flags.is_runtime() && self.is_delegate_type(method.declaring_type())? {
            return self.call_delegate_member(method, def, args);
        }
        if let Some(native) = intrinsics::lookup(self, method)? {
            return native(self, &args);
        }
        Err(Error::Execution(format!(
            "{} has no implementation",
            self.method_name(method)
        )))
    }

    fn call_delegate_member(&self, method: RuntimeMethodId, def: &MethodDef, args: Vec<Value>) -> Result<Completion> {
        match def.name.as_str() {
            "Invoke" => {
                let mut args = args.into_iter();
                match args.next() {
                    Some(Value::Delegate(delegate)) => delegate.call(self, &args.collect::<Vec<_>>()),
                    Some(Value::Null) | None => self.throw_new("System", "NullReferenceException", "Delegate is null"),
                    Some(other) => Err(Error::Execution(format!(
                        "{} called on a {}",
                        self.method_name(method),
                        other.kind()
                    ))),
                }
            }
            _ => Err(Error::NotSupported(format!(
                "{} of a delegate cannot be called directly",
                self.method_name(method)
            ))),
        }
    }

    /// Run the class constructor of `ty` once.
    ///
    /// The type is marked initialized before its constructor runs, so a constructor touching
    /// its own statics does not recurse.
    ///
    /// # Errors
    /// Returns [`Error::ManagedException`] if the class constructor throws.
    pub fn ensure_initialized(&self, ty: RuntimeTypeId) -> Result<()> {
        if self.initialized.contains_key(&ty) || self.initialized.insert(ty, ()).is_some() {
            return Ok(());
        }
        let Some(index) = self.type_def(ty)?.method_index(".cctor") else {
            return Ok(());
        };
        let cctor = RuntimeMethodId {
            assembly: ty.assembly,
            method: MethodId { ty: ty.ty, index },
        };
        log::trace!("Running type initializer of {}", self.type_name(ty));
        if let Completion::Throw(exception) = self.call(cctor, Vec::new())? {
            return Err(Error::ManagedException(format!(
                "type initializer of {} failed: {}",
                self.type_name(ty),
                self.describe_exception(&exception)
            )));
        }
        Ok(())
    }

    /// A new base class library exception carrying `message`.
    ///
    /// # Errors
    /// Returns a resolution error if the exception type does not exist.
    pub fn new_exception(&self, namespace: &str, name: &str, message: &str) -> Result<Value> {
        let ty = self.corlib_type(namespace, name)?;
        let object = self.new_object(ty)?;
        let field = self.find_field(ty, EXCEPTION_MESSAGE_FIELD)?;
        if let Some(storage) = object.field(field) {
            *write_lock!(storage) = Value::string(message);
        }
        Ok(Value::Object(object))
    }

    /// Complete with a new base class library exception.
    pub(crate) fn throw_new(&self, namespace: &str, name: &str, message: &str) -> Result<Completion> {
        Ok(Completion::Throw(self.new_exception(namespace, name, message)?))
    }

    /// The message of an exception object, if it is one.
    #[must_use]
    pub fn exception_message(&self, object: &Object) -> Option<String> {
        let exception = self.corlib_type("System", "Exception").ok()?;
        let field = self.find_field(exception, EXCEPTION_MESSAGE_FIELD).ok()?;
        let storage = object.field(field)?;
        let value = storage.read().ok()?;
        value.as_str().map(str::to_string)
    }

    fn execute(
        &self,
        method: RuntimeMethodId,
        def: &MethodDef,
        body: &MethodBody,
        args: Vec<Value>,
    ) -> Result<Completion> {
        let locals = body
            .locals
            .iter()
            .map(|local| self.default_value(method.assembly, local).map(slot))
            .collect::<Result<Vec<_>>>()?;
        let mut frame = Frame {
            method,
            def,
            args: args.into_iter().map(slot).collect(),
            locals,
            stack: Vec::with_capacity(usize::from(body.max_stack)),
        };
        log::trace!("Entering {}", self.method_name(method));

        let clauses = &body.exception_handlers;
        let mut pending: Vec<Pending> = Vec::new();
        let mut caught: Vec<(usize, Value)> = Vec::new();
        let mut pc = 0usize;

        loop {
            let instruction = body.instructions.get(pc).ok_or_else(|| {
                Error::Execution(format!(
                    "Execution ran past the end of {}",
                    self.method_name(method)
                ))
            })?;

            let resume = match handlers::step(self, &mut frame, instruction)? {
                StepResult::Continue => Resume::At(pc + 1),
                StepResult::Branch { target } => Resume::At(target),
                StepResult::Return { value } => {
                    log::trace!("Leaving {}", self.method_name(method));
                    return Ok(Completion::Return(value));
                }
                StepResult::Throw { exception } => {
                    self.raise(&mut frame, clauses, pc, exception, &mut pending, &mut caught)?
                }
                StepResult::Rethrow => {
                    let Some((_, exception)) = caught.last().cloned() else {
                        return Err(Error::Execution(format!(
                            "rethrow outside a catch handler in {}",
                            self.method_name(method)
                        )));
                    };
                    self.raise(&mut frame, clauses, pc, exception, &mut pending, &mut caught)?
                }
                StepResult::Leave { target } => {
                    frame.stack.clear();
                    caught.retain(|(clause, _)| {
                        !(in_handler(&clauses[*clause], pc) && !in_handler(&clauses[*clause], target))
                    });
                    let finallys = clauses
                        .iter()
                        .enumerate()
                        .filter(|(_, c)| {
                            c.flags.contains(ExceptionHandlerFlags::FINALLY)
                                && protects(c, pc)
                                && !protects(c, target)
                        })
                        .map(|(index, _)| index)
                        .collect();
                    pending.push(Pending::Leave {
                        target,
                        finallys,
                        running: None,
                    });
                    continue_pending(&mut frame, clauses, &mut pending, &mut caught)?
                }
                StepResult::EndFinally => {
                    if pending.is_empty() {
                        return Err(Error::Execution(format!(
                            "endfinally outside a finally handler in {}",
                            self.method_name(method)
                        )));
                    }
                    frame.stack.clear();
                    continue_pending(&mut frame, clauses, &mut pending, &mut caught)?
                }
            };

            match resume {
                Resume::At(next) => pc = next,
                Resume::Propagate(exception) => {
                    log::trace!(
                        "Exception escapes {}: {}",
                        self.method_name(method),
                        self.describe_exception(&exception)
                    );
                    return Ok(Completion::Throw(exception));
                }
            }
        }
    }

    /// Start unwinding for `exception` raised at `pc`.
    fn raise(
        &self,
        frame: &mut Frame<'_>,
        clauses: &[ExceptionHandler],
        pc: usize,
        exception: Value,
        pending: &mut Vec<Pending>,
        caught: &mut Vec<(usize, Value)>,
    ) -> Result<Resume> {
        // An exception escaping a running finally abandons the transfer that started it.
        while let Some(running) = pending.last().and_then(Pending::running) {
            if in_handler(&clauses[running], pc) {
                pending.pop();
            } else {
                break;
            }
        }
        caught.retain(|(clause, _)| !in_handler(&clauses[*clause], pc));

        let mut finallys = Vec::new();
        let mut catch = None;
        for (index, clause) in clauses.iter().enumerate() {
            if !protects(clause, pc) {
                continue;
            }
            if is_cleanup(clause) {
                finallys.push(index);
            } else if clause.flags.contains(ExceptionHandlerFlags::FILTER) {
                log::debug!("Skipping filter clause in {}", self.method_name(frame.method));
            } else if self.catches(frame.assembly(), clause, &exception)? {
                catch = Some(index);
                break;
            }
        }

        pending.push(Pending::Unwind {
            exception,
            finallys,
            catch,
            running: None,
        });
        continue_pending(frame, clauses, pending, caught)
    }

    fn catches(&self, assembly: usize, clause: &ExceptionHandler, exception: &Value) -> Result<bool> {
        match clause.catch_type {
            Some(handle) => {
                let ty = self.resolve_type(assembly, handle)?;
                self.is_instance_of(exception, ty)
            }
            None => Ok(true),
        }
    }
}

/// Run the next finally clause of the innermost pending transfer, or complete the transfer.
fn continue_pending(
    frame: &mut Frame<'_>,
    clauses: &[ExceptionHandler],
    pending: &mut Vec<Pending>,
    caught: &mut Vec<(usize, Value)>,
) -> Result<Resume> {
    let Some(top) = pending.last_mut() else {
        return Err(Error::Execution(format!(
            "No pending control transfer in {}",
            frame.def.name
        )));
    };
    let (finallys, running) = match top {
        Pending::Leave { finallys, running, .. } | Pending::Unwind { finallys, running, .. } => {
            (finallys, running)
        }
    };
    if !finallys.is_empty() {
        let next = finallys.remove(0);
        *running = Some(next);
        frame.stack.clear();
        return Ok(Resume::At(clauses[next].handler_start));
    }

    Ok(match pending.pop() {
        Some(Pending::Leave { target, .. }) => Resume::At(target),
        Some(Pending::Unwind {
            exception,
            catch: Some(index),
            ..
        }) => {
            frame.stack.clear();
            frame.push(exception.clone());
            caught.push((index, exception));
            Resume::At(clauses[index].handler_start)
        }
        Some(Pending::Unwind { exception, .. }) => Resume::Propagate(exception),
        None => Resume::Propagate(Value::Null),
    })
}

#[cfg(test)]
mod tests;
