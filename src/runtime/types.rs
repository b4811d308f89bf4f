//! Resolution of references between loaded assemblies.
//!
//! References are resolved lazily and cached per assembly: a TypeRef by walking its resolution
//! scope into the defining assembly, a MemberRef by matching name and structural signature on
//! the resolved parent and its base types. Generic instantiations resolve to their generic type
//! definition; the interpreter erases type arguments.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    assembly::Operand,
    metadata::{
        model::{
            FieldHandle, FieldId, MemberSig, MethodHandle, MethodId, ModuleDef, ResolutionScope,
            TypeHandle,
        },
        signatures::{MethodSig, TypeSig},
    },
    runtime::{
        value::{slot, Object, Value},
        Runtime, RuntimeFieldId, RuntimeMethodId, RuntimeTypeId, CORLIB_INDEX,
    },
    signature::binary::describe_sig,
    Error, Result,
};

/// Longest base type chain followed before a cycle is assumed.
const MAX_HIERARCHY_DEPTH: usize = 64;

impl Runtime {
    /// A base class library type by namespace and name.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the base class library does not define it.
    pub fn corlib_type(&self, namespace: &str, name: &str) -> Result<RuntimeTypeId> {
        self.module(CORLIB_INDEX)?
            .find_type(namespace, name)
            .map(|ty| RuntimeTypeId {
                assembly: CORLIB_INDEX,
                ty,
            })
            .ok_or_else(|| Error::TypeNotFound(format!("{namespace}.{name}")))
    }

    /// Resolve a type handle of `assembly` to its definition.
    ///
    /// # Errors
    /// Returns a resolution error if the defining assembly or type cannot be found.
    pub fn resolve_type(&self, assembly: usize, handle: TypeHandle) -> Result<RuntimeTypeId> {
        match handle {
            TypeHandle::Def(ty) => {
                self.module(assembly)?.type_def(ty)?;
                Ok(RuntimeTypeId { assembly, ty })
            }
            TypeHandle::Ref(index) => self.resolve_type_ref(assembly, index),
            TypeHandle::Spec(index) => {
                let signature = self
                    .module(assembly)?
                    .type_specs
                    .get(index)
                    .ok_or_else(|| malformed_error!("Dangling TypeSpec #{}", index))?;
                self.sig_type(assembly, signature)
            }
        }
    }

    fn resolve_type_ref(&self, assembly: usize, index: usize) -> Result<RuntimeTypeId> {
        let loaded = self.assembly(assembly)?;
        if let Some(hit) = loaded.type_refs.get(&index) {
            return Ok(*hit);
        }

        let module = loaded.module();
        let reference = module
            .type_refs
            .get(index)
            .ok_or_else(|| malformed_error!("Dangling TypeRef #{}", index))?;
        let not_found = |scope: &str| {
            Error::TypeNotFound(format!(
                "{} in {}",
                module.type_full_name(TypeHandle::Ref(index)),
                scope
            ))
        };

        let resolved = match reference.scope {
            ResolutionScope::Module => module
                .find_type(&reference.namespace, &reference.name)
                .map(|ty| RuntimeTypeId { assembly, ty })
                .ok_or_else(|| not_found(&module.name))?,
            ResolutionScope::AssemblyRef(target) => {
                let name = &module
                    .assembly_refs
                    .get(target)
                    .ok_or_else(|| malformed_error!("Dangling AssemblyRef #{}", target))?
                    .name;
                let target = self.assembly_by_name(name)?;
                self.module(target)?
                    .find_type(&reference.namespace, &reference.name)
                    .map(|ty| RuntimeTypeId {
                        assembly: target,
                        ty,
                    })
                    .ok_or_else(|| not_found(name))?
            }
            ResolutionScope::TypeRef(outer) => {
                let outer = self.resolve_type_ref(assembly, outer)?;
                self.module(outer.assembly)?
                    .find_nested_type(outer.ty, &reference.name)
                    .map(|ty| RuntimeTypeId {
                        assembly: outer.assembly,
                        ty,
                    })
                    .ok_or_else(|| not_found(&self.type_name(outer)))?
            }
        };
        loaded.type_refs.insert(index, resolved);
        Ok(resolved)
    }

    /// The runtime type standing for a signature type.
    ///
    /// Primitives map to their base class library types, arrays to `System.Array`, generic
    /// instances to their definition and generic parameters to `System.Object`.
    ///
    /// # Errors
    /// Returns a resolution error if a referenced type cannot be found.
    pub fn sig_type(&self, assembly: usize, signature: &TypeSig) -> Result<RuntimeTypeId> {
        if let Some((namespace, name)) = signature.primitive_name() {
            return self.corlib_type(namespace, name);
        }
        match signature {
            TypeSig::Class(handle) | TypeSig::ValueType(handle) => self.resolve_type(assembly, *handle),
            TypeSig::GenericInst { base, .. } => self.resolve_type(assembly, *base),
            TypeSig::SzArray(_) => self.corlib_type("System", "Array"),
            TypeSig::Var(_) | TypeSig::MVar(_) => self.corlib_type("System", "Object"),
            TypeSig::ByRef(inner) | TypeSig::Ptr(inner) => self.sig_type(assembly, inner),
            _ => Err(malformed_error!("Unexpected signature element {:?}", signature)),
        }
    }

    /// The base type of `ty`, `None` for roots and interfaces.
    ///
    /// # Errors
    /// Returns a resolution error if the base type cannot be found.
    pub fn base_type(&self, ty: RuntimeTypeId) -> Result<Option<RuntimeTypeId>> {
        match self.type_def(ty)?.extends {
            Some(handle) => Ok(Some(self.resolve_type(ty.assembly, handle)?)),
            None => Ok(None),
        }
    }

    /// `true` if `ty` is `base` or derives from it.
    ///
    /// # Errors
    /// Returns a resolution error if a base type cannot be found.
    pub fn is_subclass_of(&self, ty: RuntimeTypeId, base: RuntimeTypeId) -> Result<bool> {
        let mut current = Some(ty);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            match current {
                Some(t) if t == base => return Ok(true),
                Some(t) => current = self.base_type(t)?,
                None => return Ok(false),
            }
        }
        Err(Error::RecursionLimit(MAX_HIERARCHY_DEPTH))
    }

    /// `true` for value types other than `System.ValueType` and `System.Enum` themselves.
    ///
    /// # Errors
    /// Returns a resolution error if a base type cannot be found.
    pub fn is_value_type(&self, ty: RuntimeTypeId) -> Result<bool> {
        let value_type = self.corlib_type("System", "ValueType")?;
        let enumeration = self.corlib_type("System", "Enum")?;
        Ok(ty != value_type && ty != enumeration && self.is_subclass_of(ty, value_type)?)
    }

    /// `true` for enumerations.
    ///
    /// # Errors
    /// Returns a resolution error if a base type cannot be found.
    pub fn is_enum(&self, ty: RuntimeTypeId) -> Result<bool> {
        let enumeration = self.corlib_type("System", "Enum")?;
        Ok(self.base_type(ty)? == Some(enumeration))
    }

    /// `true` for concrete delegate types.
    ///
    /// # Errors
    /// Returns a resolution error if a base type cannot be found.
    pub fn is_delegate_type(&self, ty: RuntimeTypeId) -> Result<bool> {
        let multicast = self.corlib_type("System", "MulticastDelegate")?;
        Ok(ty != multicast && self.is_subclass_of(ty, multicast)?)
    }

    /// Resolve a method handle of `assembly` to its definition.
    ///
    /// # Errors
    /// Returns a resolution error if the parent type or a matching method cannot be found.
    pub fn resolve_method(&self, assembly: usize, handle: MethodHandle) -> Result<RuntimeMethodId> {
        let index = match handle {
            MethodHandle::Def(method) => {
                self.module(assembly)?.method(method)?;
                return Ok(RuntimeMethodId { assembly, method });
            }
            MethodHandle::Ref(index) => index,
        };

        let loaded = self.assembly(assembly)?;
        if let Some(hit) = loaded.method_refs.get(&index) {
            return Ok(*hit);
        }
        let module = loaded.module();
        let reference = module
            .member_refs
            .get(index)
            .ok_or_else(|| malformed_error!("Dangling MemberRef #{}", index))?;
        let MemberSig::Method(signature) = &reference.signature else {
            return Err(malformed_error!("MemberRef #{} is not a method", index));
        };

        let parent = self.resolve_type(assembly, reference.parent)?;
        let mut current = Some(parent);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(ty) = current else { break };
            let target = self.module(ty.assembly)?;
            let def = target.type_def(ty.ty)?;
            let found = def.methods.iter().position(|m| {
                m.name == reference.name && signatures_match(module, signature, target, &m.signature)
            });
            if let Some(found) = found {
                let resolved = RuntimeMethodId {
                    assembly: ty.assembly,
                    method: MethodId {
                        ty: ty.ty,
                        index: found,
                    },
                };
                loaded.method_refs.insert(index, resolved);
                return Ok(resolved);
            }
            current = self.base_type(ty)?;
        }
        Err(Error::MethodNotFound {
            klass: self.type_name(parent),
            method: reference.name.clone(),
        })
    }

    /// Resolve a field handle of `assembly` to its definition.
    ///
    /// # Errors
    /// Returns a resolution error if the parent type or the field cannot be found.
    pub fn resolve_field(&self, assembly: usize, handle: FieldHandle) -> Result<RuntimeFieldId> {
        let index = match handle {
            FieldHandle::Def(field) => {
                self.module(assembly)?.field(field)?;
                return Ok(RuntimeFieldId { assembly, field });
            }
            FieldHandle::Ref(index) => index,
        };

        let loaded = self.assembly(assembly)?;
        if let Some(hit) = loaded.field_refs.get(&index) {
            return Ok(*hit);
        }
        let reference = loaded
            .module()
            .member_refs
            .get(index)
            .ok_or_else(|| malformed_error!("Dangling MemberRef #{}", index))?;
        if !matches!(reference.signature, MemberSig::Field(_)) {
            return Err(malformed_error!("MemberRef #{} is not a field", index));
        }
        let parent = self.resolve_type(assembly, reference.parent)?;
        let resolved = self.find_field(parent, &reference.name)?;
        loaded.field_refs.insert(index, resolved);
        Ok(resolved)
    }

    /// Find a field by name on `ty` or its base types.
    ///
    /// # Errors
    /// Returns [`Error::FieldNotFound`] if no type in the hierarchy declares it.
    pub fn find_field(&self, ty: RuntimeTypeId, name: &str) -> Result<RuntimeFieldId> {
        let mut current = Some(ty);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(t) = current else { break };
            if let Some(index) = self.type_def(t)?.field_index(name) {
                return Ok(RuntimeFieldId {
                    assembly: t.assembly,
                    field: FieldId { ty: t.ty, index },
                });
            }
            current = self.base_type(t)?;
        }
        Err(Error::FieldNotFound {
            klass: self.type_name(ty),
            field: name.to_string(),
        })
    }

    /// Find a method declared directly on `ty` by name and parameter count.
    #[must_use]
    pub fn find_method(&self, ty: RuntimeTypeId, name: &str, params: usize) -> Option<RuntimeMethodId> {
        let def = self.type_def(ty).ok()?;
        def.methods
            .iter()
            .position(|m| m.name == name && m.signature.params.len() == params)
            .map(|index| RuntimeMethodId {
                assembly: ty.assembly,
                method: MethodId { ty: ty.ty, index },
            })
    }

    /// The most derived override of `method` for a receiver of type `receiver`.
    ///
    /// Non-virtual methods are returned unchanged.
    ///
    /// # Errors
    /// Returns a resolution error if a base type cannot be found.
    pub fn resolve_virtual(&self, method: RuntimeMethodId, receiver: RuntimeTypeId) -> Result<RuntimeMethodId> {
        let declared = self.method_def(method)?;
        if !declared.is_virtual() || receiver == method.declaring_type() {
            return Ok(method);
        }
        let declared_module = self.module(method.assembly)?;

        let mut current = Some(receiver);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(ty) = current else { break };
            if ty == method.declaring_type() {
                return Ok(method);
            }
            let module = self.module(ty.assembly)?;
            let def = module.type_def(ty.ty)?;
            let found = def.methods.iter().position(|m| {
                m.is_virtual()
                    && m.name == declared.name
                    && signatures_match(declared_module, &declared.signature, module, &m.signature)
            });
            if let Some(index) = found {
                return Ok(RuntimeMethodId {
                    assembly: ty.assembly,
                    method: MethodId { ty: ty.ty, index },
                });
            }
            current = self.base_type(ty)?;
        }
        Ok(method)
    }

    /// The runtime type of a value, `None` for null and pointers.
    ///
    /// # Errors
    /// Returns a resolution error if a base class library type is missing.
    pub fn type_of(&self, value: &Value) -> Result<Option<RuntimeTypeId>> {
        let primitive = |name: &str| self.corlib_type("System", name).map(Some);
        match value {
            Value::Null | Value::Ref(_) | Value::MethodPtr(_) => Ok(None),
            Value::I4(_) => primitive("Int32"),
            Value::I8(_) => primitive("Int64"),
            Value::R8(_) => primitive("Double"),
            Value::NativeInt(_) => primitive("IntPtr"),
            Value::String(_) => primitive("String"),
            Value::Array(_) => primitive("Array"),
            Value::Object(object) => Ok(Some(object.ty)),
            Value::Delegate(delegate) => Ok(Some(delegate.ty)),
        }
    }

    /// `true` if `value` is a non-null instance of `ty` or a type derived from it.
    ///
    /// # Errors
    /// Returns a resolution error if a base type cannot be found.
    pub fn is_instance_of(&self, value: &Value, ty: RuntimeTypeId) -> Result<bool> {
        match self.type_of(value)? {
            Some(actual) => self.is_subclass_of(actual, ty),
            None => Ok(false),
        }
    }

    /// The zero value of a signature type.
    ///
    /// # Errors
    /// Returns a resolution error if a value type cannot be found.
    pub fn default_value(&self, assembly: usize, signature: &TypeSig) -> Result<Value> {
        Ok(match signature {
            TypeSig::Boolean
            | TypeSig::Char
            | TypeSig::I1
            | TypeSig::U1
            | TypeSig::I2
            | TypeSig::U2
            | TypeSig::I4
            | TypeSig::U4 => Value::I4(0),
            TypeSig::I8 | TypeSig::U8 => Value::I8(0),
            TypeSig::R4 | TypeSig::R8 => Value::R8(0.0),
            TypeSig::I | TypeSig::U => Value::NativeInt(0),
            TypeSig::ValueType(handle) => {
                let ty = self.resolve_type(assembly, *handle)?;
                self.default_of_value_type(ty)?
            }
            TypeSig::GenericInst {
                base,
                value_type: true,
                ..
            } => {
                let ty = self.resolve_type(assembly, *base)?;
                self.default_of_value_type(ty)?
            }
            _ => Value::Null,
        })
    }

    /// The zero value of a storage location of type `ty`.
    ///
    /// # Errors
    /// Returns a resolution error if a base type cannot be found.
    pub fn default_of(&self, ty: RuntimeTypeId) -> Result<Value> {
        if self.is_value_type(ty)? {
            self.default_of_value_type(ty)
        } else {
            Ok(Value::Null)
        }
    }

    fn default_of_value_type(&self, ty: RuntimeTypeId) -> Result<Value> {
        if self.is_enum(ty)? {
            return Ok(Value::I4(0));
        }
        if ty.assembly == CORLIB_INDEX {
            let def = self.type_def(ty)?;
            if let Some(primitive) = TypeSig::from_primitive_name(&def.namespace, &def.name) {
                return self.default_value(CORLIB_INDEX, &primitive);
            }
        }
        Ok(Value::Object(self.new_object(ty)?))
    }

    /// A fresh instance of `ty` with every instance field at its default.
    ///
    /// # Errors
    /// Returns a resolution error if a field type or base type cannot be found.
    pub fn new_object(&self, ty: RuntimeTypeId) -> Result<Arc<Object>> {
        let fields = DashMap::new();
        let mut current = Some(ty);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            let Some(t) = current else { break };
            for (index, field) in self.type_def(t)?.fields.iter().enumerate() {
                if field.is_static() {
                    continue;
                }
                let id = RuntimeFieldId {
                    assembly: t.assembly,
                    field: FieldId { ty: t.ty, index },
                };
                fields.insert(id, slot(self.default_value(t.assembly, &field.signature)?));
            }
            current = self.base_type(t)?;
        }
        Ok(Arc::new(Object { ty, fields }))
    }

    /// Resolve every reference of a loaded assembly.
    ///
    /// Checks type references, member references, base types and every token operand of every
    /// method body, loading referenced assemblies as needed.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] naming the first reference that does not resolve.
    pub fn verify(&self, assembly: usize) -> Result<()> {
        let module = self.module(assembly)?;
        let fail = |what: String, error: Error| {
            Error::Validation(format!("{}: {} does not resolve: {}", module.name, what, error))
        };

        for index in 0..module.type_refs.len() {
            self.resolve_type(assembly, TypeHandle::Ref(index))
                .map_err(|e| fail(module.type_full_name(TypeHandle::Ref(index)), e))?;
        }
        for (index, reference) in module.member_refs.iter().enumerate() {
            let result = match reference.signature {
                MemberSig::Method(_) => self.resolve_method(assembly, MethodHandle::Ref(index)).map(drop),
                MemberSig::Field(_) => self.resolve_field(assembly, FieldHandle::Ref(index)).map(drop),
            };
            result.map_err(|e| {
                fail(
                    format!("{}::{}", module.type_full_name(reference.parent), reference.name),
                    e,
                )
            })?;
        }
        for (index, ty) in module.types.iter().enumerate() {
            if let Some(base) = ty.extends {
                self.resolve_type(assembly, base)
                    .map_err(|e| fail(format!("base type of {}", module.type_full_name(TypeHandle::Def(index))), e))?;
            }
        }
        for id in module.method_ids() {
            let Some(body) = &module.method(id)?.body else { continue };
            for (position, instruction) in body.instructions.iter().enumerate() {
                let result = match &instruction.operand {
                    Operand::Method(handle) => self.resolve_method(assembly, *handle).map(drop),
                    Operand::Field(handle) => self.resolve_field(assembly, *handle).map(drop),
                    Operand::Type(handle) => self.resolve_type(assembly, *handle).map(drop),
                    _ => Ok(()),
                };
                result.map_err(|e| {
                    fail(
                        format!(
                            "operand of {} at #{} in {}",
                            instruction.opcode.mnemonic(),
                            position,
                            module.type_full_name(TypeHandle::Def(id.ty))
                        ),
                        e,
                    )
                })?;
            }
        }
        log::debug!("Verified {}", module.name);
        Ok(())
    }
}

/// `true` if a method signature seen from `a` describes the same shape as one seen from `b`.
fn signatures_match(a: &ModuleDef, sig_a: &MethodSig, b: &ModuleDef, sig_b: &MethodSig) -> bool {
    if sig_a.has_this != sig_b.has_this
        || sig_a.generic_param_count != sig_b.generic_param_count
        || sig_a.params.len() != sig_b.params.len()
    {
        return false;
    }
    let same = |x: &TypeSig, y: &TypeSig| match (describe_sig(a, x), describe_sig(b, y)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    };
    same(&sig_a.ret, &sig_b.ret) && sig_a.params.iter().zip(&sig_b.params).all(|(x, y)| same(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        builder::{MethodBuilder, TypeBuilder},
        flags::{FieldAttributes, TypeAttributes},
        model::FieldDef,
    };

    fn game() -> ModuleDef {
        let mut module = ModuleDef::new("Game");
        let object = module.corlib_type("System", "Object");
        let base = TypeBuilder::new("Game", "Unit").extends(object).build(&mut module);
        module
            .add_field(base, FieldDef::new("hp", FieldAttributes::PUBLIC, TypeSig::I4))
            .unwrap();
        MethodBuilder::new("Describe")
            .virtual_method()
            .returns(TypeSig::String)
            .implementation(|asm| {
                asm.ldstr("unit")?.ret()?;
                Ok(())
            })
            .build(&mut module, base)
            .unwrap();

        let unit = module.type_ref(ResolutionScope::Module, "Game", "Unit");
        let derived = TypeBuilder::new("Game", "Hero").extends(unit).build(&mut module);
        MethodBuilder::new("Describe")
            .virtual_method()
            .returns(TypeSig::String)
            .implementation(|asm| {
                asm.ldstr("hero")?.ret()?;
                Ok(())
            })
            .build(&mut module, derived)
            .unwrap();

        let value_type = module.corlib_type("System", "ValueType");
        TypeBuilder::new("Game", "Point")
            .flags(TypeAttributes::PUBLIC | TypeAttributes::SEALED)
            .extends(value_type)
            .build(&mut module);
        module
    }

    #[test]
    fn references_resolve_across_assemblies() {
        let runtime = Runtime::new().unwrap();
        let game = runtime.load_module(game(), None).unwrap();
        let object = runtime.resolve_type(game, TypeHandle::Ref(0)).unwrap();
        assert_eq!(object, runtime.corlib_type("System", "Object").unwrap());
        assert!(runtime.assembly(game).unwrap().type_refs.contains_key(&0));
        runtime.verify(game).unwrap();
    }

    #[test]
    fn hierarchy_queries() {
        let runtime = Runtime::new().unwrap();
        let game = runtime.load_module(game(), None).unwrap();
        let unit = RuntimeTypeId { assembly: game, ty: 1 };
        let hero = RuntimeTypeId { assembly: game, ty: 2 };
        let point = RuntimeTypeId { assembly: game, ty: 3 };
        assert!(runtime.is_subclass_of(hero, unit).unwrap());
        assert!(!runtime.is_subclass_of(unit, hero).unwrap());
        assert!(runtime.is_value_type(point).unwrap());
        assert!(!runtime.is_value_type(hero).unwrap());
        assert!(runtime.is_delegate_type(runtime.corlib_type("System", "Action").unwrap()).unwrap());

        let hp = runtime.find_field(hero, "hp").unwrap();
        assert_eq!(hp.declaring_type(), unit);
        let object = runtime.new_object(hero).unwrap();
        assert!(object.field(hp).is_some());
    }

    #[test]
    fn virtual_dispatch_picks_most_derived() {
        let runtime = Runtime::new().unwrap();
        let game = runtime.load_module(game(), None).unwrap();
        let describe = RuntimeMethodId {
            assembly: game,
            method: MethodId { ty: 1, index: 0 },
        };
        let hero = RuntimeTypeId { assembly: game, ty: 2 };
        let resolved = runtime.resolve_virtual(describe, hero).unwrap();
        assert_eq!(resolved.declaring_type(), hero);
    }

    #[test]
    fn unresolvable_reference_fails_verification() {
        let runtime = Runtime::new().unwrap();
        let mut module = ModuleDef::new("Broken");
        module.corlib_type("System", "DoesNotExist");
        let broken = runtime.load_module(module, None).unwrap();
        assert!(matches!(runtime.verify(broken), Err(Error::Validation(_))));
    }

    #[test]
    fn member_refs_match_structurally() {
        let runtime = Runtime::new().unwrap();
        let mut module = ModuleDef::new("Caller");
        let string = module.corlib_type("System", "String");
        let concat = module.member_ref(
            string,
            "Concat",
            MemberSig::Method(MethodSig::static_method(
                TypeSig::String,
                vec![TypeSig::String, TypeSig::String, TypeSig::String],
            )),
        );
        let caller = runtime.load_module(module, None).unwrap();
        let resolved = runtime.resolve_method(caller, MethodHandle::Ref(concat)).unwrap();
        let def = runtime.method_def(resolved).unwrap();
        assert_eq!(def.signature.params.len(), 3);
        assert_eq!(resolved.assembly, CORLIB_INDEX);
    }
}
