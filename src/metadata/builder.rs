//! Fluent builders for types and methods.
//!
//! The builders add definitions to a [`ModuleDef`]; method bodies are written with the
//! [`InstructionAssembler`] and get their maximum stack depth computed unless set explicitly.
//!
//! ```rust
//! use dotweave::metadata::{builder::{MethodBuilder, TypeBuilder}, ModuleDef, TypeSig};
//!
//! let mut module = ModuleDef::new("Demo");
//! let object = module.corlib_type("System", "Object");
//! let ty = TypeBuilder::new("Demo", "Calculator").extends(object).build(&mut module);
//! let add = MethodBuilder::new("Add")
//!     .static_method()
//!     .param("a", TypeSig::I4)
//!     .param("b", TypeSig::I4)
//!     .returns(TypeSig::I4)
//!     .implementation(|asm| {
//!         asm.ldarg_0()?.ldarg_1()?.add()?.ret()?;
//!         Ok(())
//!     })
//!     .build(&mut module, ty)?;
//! assert_eq!(module.method(add)?.body.as_ref().map(|b| b.max_stack), Some(2));
//! # Ok::<(), dotweave::Error>(())
//! ```

use crate::{
    assembly::InstructionAssembler,
    metadata::{
        body::MethodBody,
        flags::{
            MethodAttributes, MethodImplAttributes, ParamAttributes, TypeAttributes,
            TYPE_VISIBILITY_MASK,
        },
        model::{GenericParam, MethodDef, MethodId, ModuleDef, ParamDef, TypeDef, TypeHandle},
        signatures::{MethodSig, TypeSig},
    },
    Result,
};

type ImplementationFn = Box<dyn FnOnce(&mut InstructionAssembler) -> Result<()>>;

/// Builder for a method definition.
pub struct MethodBuilder {
    method: MethodDef,
    locals: Vec<TypeSig>,
    max_stack: Option<u16>,
    init_locals: bool,
    implementation: Option<ImplementationFn>,
}

impl MethodBuilder {
    /// A public instance method returning `void` without parameters.
    #[must_use]
    pub fn new(name: &str) -> Self {
        MethodBuilder {
            method: MethodDef::new(
                name,
                MethodAttributes::PUBLIC | MethodAttributes::HIDE_BY_SIG,
                MethodSig::instance(TypeSig::Void, Vec::new()),
            ),
            locals: Vec::new(),
            max_stack: None,
            init_locals: true,
            implementation: None,
        }
    }

    /// A public instance constructor.
    #[must_use]
    pub fn constructor() -> Self {
        MethodBuilder::new(".ctor").flags(
            MethodAttributes::PUBLIC
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::SPECIAL_NAME
                | MethodAttributes::RT_SPECIAL_NAME,
        )
    }

    /// Replace the method attributes. `STATIC` is kept in sync with the signature.
    #[must_use]
    pub fn flags(mut self, flags: MethodAttributes) -> Self {
        self.method.signature.has_this = !flags.contains(MethodAttributes::STATIC);
        self.method.flags = flags;
        self
    }

    /// Replace the implementation attributes.
    #[must_use]
    pub fn impl_flags(mut self, flags: MethodImplAttributes) -> Self {
        self.method.impl_flags = flags;
        self
    }

    /// Make the method static.
    #[must_use]
    pub fn static_method(mut self) -> Self {
        self.method.flags |= MethodAttributes::STATIC;
        self.method.signature.has_this = false;
        self
    }

    /// Make the method virtual.
    #[must_use]
    pub fn virtual_method(mut self) -> Self {
        self.method.flags |= MethodAttributes::VIRTUAL;
        self
    }

    /// Set the return type.
    #[must_use]
    pub fn returns(mut self, ret: TypeSig) -> Self {
        self.method.signature.ret = ret;
        self
    }

    /// Append a parameter.
    #[must_use]
    pub fn param(self, name: &str, signature: TypeSig) -> Self {
        self.param_with(name, signature, ParamAttributes::empty())
    }

    /// Append a parameter with explicit flags, e.g. `OUT`.
    #[must_use]
    pub fn param_with(mut self, name: &str, signature: TypeSig, flags: ParamAttributes) -> Self {
        self.method.signature.params.push(signature);
        self.method.params.push(ParamDef {
            name: name.to_string(),
            sequence: self.method.signature.params.len() as u16,
            flags,
        });
        self
    }

    /// Declare a method generic parameter.
    #[must_use]
    pub fn generic_param(mut self, name: &str) -> Self {
        self.method.generic_params.push(GenericParam::new(name));
        self.method.signature.generic_param_count = self.method.generic_params.len() as u32;
        self
    }

    /// Append a local variable.
    #[must_use]
    pub fn local(mut self, signature: TypeSig) -> Self {
        self.locals.push(signature);
        self
    }

    /// Set the zero-initialisation flag of the locals.
    #[must_use]
    pub fn init_locals(mut self, init: bool) -> Self {
        self.init_locals = init;
        self
    }

    /// Set the maximum stack depth instead of computing it.
    #[must_use]
    pub fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = Some(max_stack);
        self
    }

    /// Provide the body.
    #[must_use]
    pub fn implementation<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut InstructionAssembler) -> Result<()> + 'static,
    {
        self.implementation = Some(Box::new(f));
        self
    }

    /// Add the method to type `ty` of `module`.
    ///
    /// # Errors
    /// Returns an error if `ty` does not exist, the implementation fails, or its labels do not
    /// resolve.
    pub fn build(self, module: &mut ModuleDef, ty: usize) -> Result<MethodId> {
        let MethodBuilder {
            method,
            locals,
            max_stack,
            init_locals,
            implementation,
        } = self;
        let returns_value = !method.signature.ret.is_void();
        let id = module.add_method(ty, method)?;

        if let Some(implementation) = implementation {
            let mut asm = InstructionAssembler::new();
            implementation(&mut asm)?;
            let code = asm.finish()?;
            let mut body = MethodBody {
                max_stack: 0,
                init_locals: init_locals && !locals.is_empty(),
                locals,
                instructions: code.instructions,
                exception_handlers: code.exception_handlers,
                sequence_points: Vec::new(),
            };
            body.validate()?;
            body.max_stack = match max_stack {
                Some(value) => value,
                None => body.compute_max_stack(module, returns_value)?,
            };
            module.method_mut(id)?.body = Some(body);
        }
        Ok(id)
    }
}

/// Builder for a type definition.
pub struct TypeBuilder {
    def: TypeDef,
}

impl TypeBuilder {
    /// A public class without base type.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        TypeBuilder {
            def: TypeDef::new(
                namespace,
                name,
                TypeAttributes::PUBLIC | TypeAttributes::BEFORE_FIELD_INIT,
                None,
            ),
        }
    }

    /// Replace the type attributes.
    #[must_use]
    pub fn flags(mut self, flags: TypeAttributes) -> Self {
        self.def.flags = flags;
        self
    }

    /// Set the base type.
    #[must_use]
    pub fn extends(mut self, base: TypeHandle) -> Self {
        self.def.extends = Some(base);
        self
    }

    /// Nest the type in `enclosing`; the namespace is cleared.
    #[must_use]
    pub fn nested_in(mut self, enclosing: usize) -> Self {
        self.def.enclosing = Some(enclosing);
        self.def.namespace.clear();
        if self.def.flags.bits() & TYPE_VISIBILITY_MASK == TypeAttributes::PUBLIC.bits() {
            self.def.flags.remove(TypeAttributes::PUBLIC);
            self.def.flags |= TypeAttributes::NESTED_PUBLIC;
        }
        self
    }

    /// Declare a type generic parameter.
    #[must_use]
    pub fn generic_param(mut self, name: &str) -> Self {
        self.def.generic_params.push(GenericParam::new(name));
        self
    }

    /// Add the type to `module` and return its index.
    pub fn build(self, module: &mut ModuleDef) -> usize {
        module.add_type(self.def)
    }
}

/// Builder for a delegate type deriving from `System.MulticastDelegate`.
///
/// Every member is runtime-implemented: `.ctor(object, native int)`, `Invoke`, `BeginInvoke`
/// and `EndInvoke`.
pub struct DelegateBuilder {
    ty: TypeBuilder,
    params: Vec<(String, TypeSig, ParamAttributes)>,
    ret: TypeSig,
}

impl DelegateBuilder {
    /// A public sealed delegate returning `void` without parameters.
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        DelegateBuilder {
            ty: TypeBuilder::new(namespace, name).flags(TypeAttributes::PUBLIC | TypeAttributes::SEALED),
            params: Vec::new(),
            ret: TypeSig::Void,
        }
    }

    /// Replace the type attributes.
    #[must_use]
    pub fn flags(mut self, flags: TypeAttributes) -> Self {
        self.ty = self.ty.flags(flags);
        self
    }

    /// Nest the delegate in `enclosing`.
    #[must_use]
    pub fn nested_in(mut self, enclosing: usize) -> Self {
        self.ty = self.ty.nested_in(enclosing);
        self
    }

    /// Declare a type generic parameter.
    #[must_use]
    pub fn generic_param(mut self, name: &str) -> Self {
        self.ty = self.ty.generic_param(name);
        self
    }

    /// Append an `Invoke` parameter.
    #[must_use]
    pub fn param(self, name: &str, signature: TypeSig) -> Self {
        self.param_with(name, signature, ParamAttributes::empty())
    }

    /// Append an `Invoke` parameter with explicit flags.
    #[must_use]
    pub fn param_with(mut self, name: &str, signature: TypeSig, flags: ParamAttributes) -> Self {
        self.params.push((name.to_string(), signature, flags));
        self
    }

    /// Set the `Invoke` return type.
    #[must_use]
    pub fn returns(mut self, ret: TypeSig) -> Self {
        self.ret = ret;
        self
    }

    /// Add the delegate type to `module` and return its index.
    ///
    /// # Errors
    /// Returns an error if a member cannot be added.
    pub fn build(self, module: &mut ModuleDef) -> Result<usize> {
        let base = module.corlib_type("System", "MulticastDelegate");
        let index = self.ty.extends(base).build(module);
        // Looked up after the type exists so that `System.AsyncCallback` can refer to itself.
        let async_result = module.corlib_type("System", "IAsyncResult");
        let async_callback = module.corlib_type("System", "AsyncCallback");

        let members = MethodAttributes::PUBLIC
            | MethodAttributes::HIDE_BY_SIG
            | MethodAttributes::NEW_SLOT
            | MethodAttributes::VIRTUAL;

        MethodBuilder::constructor()
            .impl_flags(MethodImplAttributes::RUNTIME)
            .param("object", TypeSig::Object)
            .param("method", TypeSig::I)
            .build(module, index)?;

        let mut invoke = MethodBuilder::new("Invoke")
            .flags(members)
            .impl_flags(MethodImplAttributes::RUNTIME)
            .returns(self.ret.clone());
        let mut begin = MethodBuilder::new("BeginInvoke")
            .flags(members)
            .impl_flags(MethodImplAttributes::RUNTIME)
            .returns(TypeSig::Class(async_result));
        for (name, signature, flags) in self.params {
            invoke = invoke.param_with(&name, signature.clone(), flags);
            begin = begin.param_with(&name, signature, flags);
        }
        invoke.build(module, index)?;
        begin
            .param("callback", TypeSig::Class(async_callback))
            .param("object", TypeSig::Object)
            .build(module, index)?;

        MethodBuilder::new("EndInvoke")
            .flags(members)
            .impl_flags(MethodImplAttributes::RUNTIME)
            .param("result", TypeSig::Class(async_result))
            .returns(self.ret)
            .build(module, index)?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{flags::FieldAttributes, model::FieldDef};

    #[test]
    fn method_builder_fills_params() {
        let mut module = ModuleDef::new("Demo");
        let ty = TypeBuilder::new("Demo", "Target").build(&mut module);
        let id = MethodBuilder::new("Greet")
            .param("prefix", TypeSig::String)
            .param_with("name", TypeSig::String.by_ref(), ParamAttributes::OUT)
            .returns(TypeSig::String)
            .implementation(|asm| {
                asm.ldarg_1()?.ret()?;
                Ok(())
            })
            .build(&mut module, ty)
            .unwrap();

        let method = module.method(id).unwrap();
        assert!(method.signature.has_this);
        assert_eq!(method.param_name(0), Some("prefix"));
        assert_eq!(method.param_name(1), Some("name"));
        assert_eq!(method.param_flags(1), ParamAttributes::OUT);
        assert_eq!(method.body.as_ref().unwrap().max_stack, 1);
    }

    #[test]
    fn nested_types_lose_namespace() {
        let mut module = ModuleDef::new("Demo");
        let outer = TypeBuilder::new("Demo", "Outer").build(&mut module);
        let inner = TypeBuilder::new("Demo", "Inner").nested_in(outer).build(&mut module);
        module
            .add_field(inner, FieldDef::new("x", FieldAttributes::PUBLIC, TypeSig::I4))
            .unwrap();
        assert_eq!(module.types[inner].namespace, "");
        assert!(module.types[inner].flags.contains(TypeAttributes::NESTED_PUBLIC));
        assert_eq!(module.find_nested_type(outer, "Inner"), Some(inner));
    }

    #[test]
    fn delegate_builder_adds_runtime_members() {
        let mut module = ModuleDef::new("Demo");
        let index = DelegateBuilder::new("Demo", "Callback")
            .param("value", TypeSig::I4.by_ref())
            .returns(TypeSig::String)
            .build(&mut module)
            .unwrap();

        let ty = &module.types[index];
        assert_eq!(module.type_full_name(ty.extends.unwrap()), "System.MulticastDelegate");
        let names: Vec<&str> = ty.methods.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, [".ctor", "Invoke", "BeginInvoke", "EndInvoke"]);
        assert!(ty.methods.iter().all(|m| m.impl_flags.is_runtime() && m.body.is_none()));

        let invoke = &ty.methods[1];
        assert_eq!(invoke.signature.params, vec![TypeSig::I4.by_ref()]);
        assert_eq!(invoke.signature.ret, TypeSig::String);
        assert!(invoke.is_virtual());
        assert_eq!(ty.methods[2].signature.params.len(), 3);
        assert_eq!(ty.methods[3].signature.ret, TypeSig::String);
    }

    #[test]
    fn static_flag_tracks_signature() {
        let mut module = ModuleDef::new("Demo");
        let ty = TypeBuilder::new("Demo", "Target").build(&mut module);
        let id = MethodBuilder::new("Run").static_method().build(&mut module, ty).unwrap();
        let method = module.method(id).unwrap();
        assert!(method.is_static());
        assert!(!method.signature.has_this);
        assert!(method.body.is_none());
    }
}
