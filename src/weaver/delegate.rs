//! Delegate shapes for woven methods.
//!
//! A [`DelegateShape`] describes the callable a woven method forwards through: the receiver
//! (for instance methods) followed by the declared parameters, and the declared return type.
//! Binding a shape first tries the standard `System.Func` / `System.Action` family of the base
//! class library and only synthesizes a dedicated delegate type when no standard shape fits:
//!
//! - any parameter or the return type is by-ref (this includes the receiver of a value type)
//! - the base class library has no delegate of the required arity

use crate::{
    corlib::{MAX_ACTION_ARITY, MAX_FUNC_ARITY},
    metadata::{
        builder::DelegateBuilder,
        flags::{ParamAttributes, TypeAttributes},
        model::{MemberSig, MethodHandle, MethodId, ModuleDef, TypeHandle},
        signatures::{MethodSig, TypeSig},
    },
    Result,
};

/// One parameter of a delegate shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeParam {
    /// Parameter name used when a delegate type is synthesized
    pub name: String,
    /// Parameter type
    pub signature: TypeSig,
    /// Parameter flags, e.g. `OUT`
    pub flags: ParamAttributes,
}

/// Parameters and return type of the callable behind a woven method.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateShape {
    /// Receiver first for instance methods, then the declared parameters
    pub params: Vec<ShapeParam>,
    /// Return type
    pub ret: TypeSig,
}

/// A standard base library delegate matching a shape.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardDelegate {
    /// Type name in `System`, e.g. ``Func`3``
    pub name: String,
    /// Generic arguments, empty for the plain `System.Action`
    pub args: Vec<TypeSig>,
    /// `true` for the `Func` family
    pub returns_value: bool,
}

/// How a woven method's delegate field is typed and invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegateBinding {
    /// Type of the static delegate field
    pub field_type: TypeSig,
    /// The `Invoke` method to call through
    pub invoke: MethodHandle,
    /// Index of the synthesized delegate type, `None` for standard delegates
    pub synthesized: Option<usize>,
}

/// `true` if type `ty` of `module` derives directly from `System.ValueType` or `System.Enum`.
///
/// Only the base type's name is inspected, so the answer does not depend on resolving other
/// assemblies.
#[must_use]
pub fn is_value_type(module: &ModuleDef, ty: usize) -> bool {
    let Some(base) = module.types.get(ty).and_then(|t| t.extends) else {
        return false;
    };
    matches!(
        module.type_name(base),
        Ok(("System", "ValueType" | "Enum"))
    )
}

impl DelegateShape {
    /// The shape of method `id`.
    ///
    /// # Errors
    /// Returns an error if the method does not exist.
    pub fn of_method(module: &ModuleDef, id: MethodId) -> Result<Self> {
        let method = module.method(id)?;
        let mut params = Vec::with_capacity(method.signature.params.len() + 1);
        if !method.is_static() {
            let receiver = if is_value_type(module, id.ty) {
                TypeSig::ValueType(TypeHandle::Def(id.ty)).by_ref()
            } else {
                TypeSig::Class(TypeHandle::Def(id.ty))
            };
            params.push(ShapeParam {
                name: "self".to_string(),
                signature: receiver,
                flags: ParamAttributes::empty(),
            });
        }
        for (index, signature) in method.signature.params.iter().enumerate() {
            params.push(ShapeParam {
                name: method
                    .param_name(index)
                    .map_or_else(|| format!("arg{}", index + 1), str::to_string),
                signature: signature.clone(),
                flags: method.param_flags(index),
            });
        }
        Ok(DelegateShape {
            params,
            ret: method.signature.ret.clone(),
        })
    }

    /// `true` if a parameter or the return type is by-ref.
    #[must_use]
    pub fn has_by_ref(&self) -> bool {
        self.ret.is_by_ref() || self.params.iter().any(|p| p.signature.is_by_ref())
    }

    /// The standard delegate for this shape, if `corlib` defines one.
    #[must_use]
    pub fn standard(&self, corlib: &ModuleDef) -> Option<StandardDelegate> {
        if self.has_by_ref() {
            return None;
        }
        let count = self.params.len();
        let mut args: Vec<TypeSig> = self.params.iter().map(|p| p.signature.clone()).collect();
        let (name, returns_value) = if self.ret.is_void() {
            if count > MAX_ACTION_ARITY {
                return None;
            }
            let name = if count == 0 {
                "Action".to_string()
            } else {
                format!("Action`{count}")
            };
            (name, false)
        } else {
            if count + 1 > MAX_FUNC_ARITY {
                return None;
            }
            args.push(self.ret.clone());
            (format!("Func`{}", count + 1), true)
        };
        corlib.find_type("System", &name)?;
        Some(StandardDelegate {
            name,
            args,
            returns_value,
        })
    }

    /// Reference the delegate for this shape from `module`, synthesizing one nested in `owner`
    /// under `synthesized_name` when no standard delegate of `corlib` fits.
    ///
    /// # Errors
    /// Returns an error if the synthesized delegate type cannot be built.
    pub fn bind(
        &self,
        module: &mut ModuleDef,
        corlib: &ModuleDef,
        owner: usize,
        synthesized_name: &str,
    ) -> Result<DelegateBinding> {
        match self.standard(corlib) {
            Some(standard) => Ok(bind_standard(module, &standard)),
            None => self.synthesize(module, owner, synthesized_name),
        }
    }

    fn synthesize(&self, module: &mut ModuleDef, owner: usize, name: &str) -> Result<DelegateBinding> {
        let mut builder = DelegateBuilder::new("", name)
            .nested_in(owner)
            .flags(TypeAttributes::NESTED_PRIVATE | TypeAttributes::SEALED)
            .returns(self.ret.clone());
        for param in &self.params {
            builder = builder.param_with(&param.name, param.signature.clone(), param.flags);
        }
        let ty = builder.build(module)?;
        let invoke = module.types[ty]
            .method_index("Invoke")
            .ok_or_else(|| synthesis_error!("Delegate {} has no Invoke", name))?;
        log::debug!("Synthesized delegate {}", module.type_full_name(TypeHandle::Def(ty)));
        Ok(DelegateBinding {
            field_type: TypeSig::Class(TypeHandle::Def(ty)),
            invoke: MethodHandle::Def(MethodId { ty, index: invoke }),
            synthesized: Some(ty),
        })
    }
}

fn bind_standard(module: &mut ModuleDef, standard: &StandardDelegate) -> DelegateBinding {
    let base = module.corlib_type("System", &standard.name);
    if standard.args.is_empty() {
        let invoke = module.member_ref(
            base,
            "Invoke",
            MemberSig::Method(MethodSig::instance(TypeSig::Void, Vec::new())),
        );
        return DelegateBinding {
            field_type: TypeSig::Class(base),
            invoke: MethodHandle::Ref(invoke),
            synthesized: None,
        };
    }

    let field_type = TypeSig::GenericInst {
        base,
        value_type: false,
        args: standard.args.clone(),
    };
    let instance = module.type_spec(field_type.clone());
    let inputs = standard.args.len() - usize::from(standard.returns_value);
    let params = (0..inputs).map(|i| TypeSig::Var(i as u32)).collect();
    let ret = if standard.returns_value {
        TypeSig::Var(inputs as u32)
    } else {
        TypeSig::Void
    };
    let invoke = module.member_ref(
        instance,
        "Invoke",
        MemberSig::Method(MethodSig::instance(ret, params)),
    );
    DelegateBinding {
        field_type,
        invoke: MethodHandle::Ref(invoke),
        synthesized: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        corlib,
        metadata::builder::{MethodBuilder, TypeBuilder},
    };

    struct Fixture {
        module: ModuleDef,
        corlib: ModuleDef,
        class: usize,
        strukt: usize,
    }

    fn fixture() -> Fixture {
        let mut module = ModuleDef::new("Game");
        let object = module.corlib_type("System", "Object");
        let value_type = module.corlib_type("System", "ValueType");
        let class = TypeBuilder::new("Game", "Player").extends(object).build(&mut module);
        let strukt = TypeBuilder::new("Game", "Stats")
            .flags(TypeAttributes::PUBLIC | TypeAttributes::SEALED)
            .extends(value_type)
            .build(&mut module);
        Fixture {
            module,
            corlib: corlib::build().unwrap(),
            class,
            strukt,
        }
    }

    #[test]
    fn instance_method_uses_func() {
        let mut f = fixture();
        let method = MethodBuilder::new("Greet")
            .param("name", TypeSig::String)
            .returns(TypeSig::String)
            .build(&mut f.module, f.class)
            .unwrap();
        let shape = DelegateShape::of_method(&f.module, method).unwrap();
        assert_eq!(shape.params.len(), 2);
        assert_eq!(shape.params[1].name, "name");

        let standard = shape.standard(&f.corlib).unwrap();
        assert_eq!(standard.name, "Func`3");
        assert_eq!(
            standard.args,
            vec![TypeSig::Class(TypeHandle::Def(f.class)), TypeSig::String, TypeSig::String]
        );

        let binding = shape.bind(&mut f.module, &f.corlib, f.class, "Delegate_Greet_000001").unwrap();
        assert!(binding.synthesized.is_none());
        let MethodHandle::Ref(invoke) = binding.invoke else {
            panic!("expected a member reference");
        };
        let reference = &f.module.member_refs[invoke];
        assert_eq!(reference.name, "Invoke");
        assert_eq!(
            reference.signature,
            MemberSig::Method(MethodSig::instance(TypeSig::Var(2), vec![TypeSig::Var(0), TypeSig::Var(1)]))
        );
    }

    #[test]
    fn parameterless_static_action() {
        let mut f = fixture();
        let method = MethodBuilder::new("Tick").static_method().build(&mut f.module, f.class).unwrap();
        let shape = DelegateShape::of_method(&f.module, method).unwrap();
        let binding = shape.bind(&mut f.module, &f.corlib, f.class, "unused").unwrap();
        assert_eq!(f.module.type_full_name(match binding.field_type {
            TypeSig::Class(handle) => handle,
            _ => panic!("expected a class"),
        }), "System.Action");
    }

    #[test]
    fn by_ref_parameters_need_a_synthesized_delegate() {
        let mut f = fixture();
        let method = MethodBuilder::new("Rename")
            .param_with("name", TypeSig::String.by_ref(), ParamAttributes::OUT)
            .returns(TypeSig::String)
            .build(&mut f.module, f.class)
            .unwrap();
        let shape = DelegateShape::of_method(&f.module, method).unwrap();
        assert!(shape.standard(&f.corlib).is_none());

        let binding = shape.bind(&mut f.module, &f.corlib, f.class, "Delegate_Rename_000002").unwrap();
        let ty = binding.synthesized.unwrap();
        let def = &f.module.types[ty];
        assert_eq!(def.enclosing, Some(f.class));
        assert_eq!(def.name, "Delegate_Rename_000002");
        assert_eq!(def.flags, TypeAttributes::NESTED_PRIVATE | TypeAttributes::SEALED);

        let MethodHandle::Def(invoke) = binding.invoke else {
            panic!("expected a definition");
        };
        let invoke = f.module.method(invoke).unwrap();
        assert_eq!(invoke.signature.params[1], TypeSig::String.by_ref());
        assert_eq!(invoke.param_flags(1), ParamAttributes::OUT);
    }

    #[test]
    fn value_type_receiver_is_by_ref() {
        let mut f = fixture();
        let method = MethodBuilder::new("Total")
            .returns(TypeSig::I4)
            .build(&mut f.module, f.strukt)
            .unwrap();
        assert!(is_value_type(&f.module, f.strukt));
        assert!(!is_value_type(&f.module, f.class));
        let shape = DelegateShape::of_method(&f.module, method).unwrap();
        assert_eq!(
            shape.params[0].signature,
            TypeSig::ValueType(TypeHandle::Def(f.strukt)).by_ref()
        );
        assert!(shape.standard(&f.corlib).is_none());
    }

    #[test]
    fn arity_beyond_the_standard_family() {
        let f = fixture();
        let many = |count: usize, ret: TypeSig| DelegateShape {
            params: (0..count)
                .map(|i| ShapeParam {
                    name: format!("p{i}"),
                    signature: TypeSig::I4,
                    flags: ParamAttributes::empty(),
                })
                .collect(),
            ret,
        };
        assert!(many(MAX_ACTION_ARITY, TypeSig::Void).standard(&f.corlib).is_some());
        assert!(many(MAX_ACTION_ARITY + 1, TypeSig::Void).standard(&f.corlib).is_none());
        assert!(many(MAX_FUNC_ARITY - 1, TypeSig::I4).standard(&f.corlib).is_some());
        assert!(many(MAX_FUNC_ARITY, TypeSig::I4).standard(&f.corlib).is_none());
    }
}
