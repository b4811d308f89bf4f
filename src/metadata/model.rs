//! In-memory object model of a module.
//!
//! [`ModuleDef`] owns every row of the module in table order. Cross references use handles
//! ([`TypeHandle`], [`MethodHandle`], [`FieldHandle`]) that index into the owning vectors, so
//! appending types, methods and fields never invalidates existing references. Metadata tokens
//! are derived from positions by [`ModuleDef::assign_tokens`] and only matter when the module
//! is written or when a stable identifier is taken.

use uguid::Guid;

use crate::{
    metadata::{
        body::MethodBody,
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, ParamAttributes, TypeAttributes},
        signatures::{MethodSig, TypeSig},
        tables::TableId,
        token::Token,
    },
    Error, Result,
};

/// Name of the base class library assembly.
pub const CORLIB_NAME: &str = "mscorlib";

/// Name of the pseudo type holding module-level members.
pub const MODULE_TYPE_NAME: &str = "<Module>";

/// Reference to a type from within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeHandle {
    /// Index into [`ModuleDef::types`]
    Def(usize),
    /// Index into [`ModuleDef::type_refs`]
    Ref(usize),
    /// Index into [`ModuleDef::type_specs`]
    Spec(usize),
}

/// Position of a method definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId {
    /// Index of the declaring type
    pub ty: usize,
    /// Index into the declaring type's methods
    pub index: usize,
}

/// Position of a field definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId {
    /// Index of the declaring type
    pub ty: usize,
    /// Index into the declaring type's fields
    pub index: usize,
}

/// Reference to a method from within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodHandle {
    /// A method defined in this module
    Def(MethodId),
    /// Index into [`ModuleDef::member_refs`]
    Ref(usize),
}

/// Reference to a field from within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldHandle {
    /// A field defined in this module
    Def(FieldId),
    /// Index into [`ModuleDef::member_refs`]
    Ref(usize),
}

/// Four-part assembly version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Version {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build number
    pub build: u16,
    /// Revision number
    pub revision: u16,
}

impl Version {
    /// Create a version.
    #[must_use]
    pub fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Version {
            major,
            minor,
            build,
            revision,
        }
    }
}

/// A referenced assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyRef {
    /// Simple name
    pub name: String,
    /// Version
    pub version: Version,
}

/// Where a [`TypeRef`] is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionScope {
    /// This module
    Module,
    /// Index into [`ModuleDef::assembly_refs`]
    AssemblyRef(usize),
    /// Enclosing type, index into [`ModuleDef::type_refs`]
    TypeRef(usize),
}

/// A reference to a type defined elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// Defining scope
    pub scope: ResolutionScope,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Name, including the generic arity suffix
    pub name: String,
}

/// Signature of a [`MemberRef`].
#[derive(Debug, Clone, PartialEq)]
pub enum MemberSig {
    /// A method reference
    Method(MethodSig),
    /// A field reference
    Field(TypeSig),
}

/// A reference to a method or field of another type.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRef {
    /// Declaring type
    pub parent: TypeHandle,
    /// Member name
    pub name: String,
    /// Member signature
    pub signature: MemberSig,
}

/// A generic parameter of a type or method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericParam {
    /// Declared name, which may differ between builds
    pub name: String,
    /// Variance and constraint flags
    pub flags: u16,
}

impl GenericParam {
    /// A parameter without constraints.
    #[must_use]
    pub fn new(name: &str) -> Self {
        GenericParam {
            name: name.to_string(),
            flags: 0,
        }
    }
}

/// A fixed argument of a custom attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeArg {
    /// `bool`
    Bool(bool),
    /// `int32`
    I4(i32),
    /// `string`, possibly null
    String(Option<String>),
}

/// A custom attribute instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAttribute {
    /// The attribute constructor
    pub ctor: MethodHandle,
    /// Fixed constructor arguments
    pub args: Vec<AttributeArg>,
}

/// A parameter row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDef {
    /// Parameter name
    pub name: String,
    /// 1-based position, 0 describes the return value
    pub sequence: u16,
    /// Flags
    pub flags: ParamAttributes,
}

/// A field definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Flags
    pub flags: FieldAttributes,
    /// Field type
    pub signature: TypeSig,
    /// Attached custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token as last read or assigned
    pub token: Token,
}

impl FieldDef {
    /// Create a field.
    #[must_use]
    pub fn new(name: &str, flags: FieldAttributes, signature: TypeSig) -> Self {
        FieldDef {
            name: name.to_string(),
            flags,
            signature,
            custom_attributes: Vec::new(),
            token: Token::default(),
        }
    }

    /// `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldAttributes::STATIC)
    }
}

/// A method definition.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Flags
    pub flags: MethodAttributes,
    /// Implementation flags
    pub impl_flags: MethodImplAttributes,
    /// Calling convention, return and parameter types
    pub signature: MethodSig,
    /// Parameter rows
    pub params: Vec<ParamDef>,
    /// Generic parameters
    pub generic_params: Vec<GenericParam>,
    /// CIL body, absent for abstract and runtime-implemented methods
    pub body: Option<MethodBody>,
    /// Attached custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token as last read or assigned
    pub token: Token,
}

impl MethodDef {
    /// Create a method without body.
    #[must_use]
    pub fn new(name: &str, flags: MethodAttributes, signature: MethodSig) -> Self {
        MethodDef {
            name: name.to_string(),
            flags,
            impl_flags: MethodImplAttributes::empty(),
            signature,
            params: Vec::new(),
            generic_params: Vec::new(),
            body: None,
            custom_attributes: Vec::new(),
            token: Token::default(),
        }
    }

    /// `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodAttributes::STATIC)
    }

    /// `true` for virtual methods.
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodAttributes::VIRTUAL)
    }

    /// `true` for instance and type constructors.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.name == ".ctor" || self.name == ".cctor"
    }

    /// Name of the parameter at signature position `index` (0-based, receiver excluded).
    #[must_use]
    pub fn param_name(&self, index: usize) -> Option<&str> {
        let sequence = u16::try_from(index + 1).ok()?;
        self.params
            .iter()
            .find(|p| p.sequence == sequence)
            .map(|p| p.name.as_str())
    }

    /// Flags of the parameter at signature position `index` (0-based, receiver excluded).
    #[must_use]
    pub fn param_flags(&self, index: usize) -> ParamAttributes {
        let Ok(sequence) = u16::try_from(index + 1) else {
            return ParamAttributes::empty();
        };
        self.params
            .iter()
            .find(|p| p.sequence == sequence)
            .map_or(ParamAttributes::empty(), |p| p.flags)
    }
}

/// A type definition.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Name, including the generic arity suffix
    pub name: String,
    /// Flags
    pub flags: TypeAttributes,
    /// Base type
    pub extends: Option<TypeHandle>,
    /// Index of the enclosing type for nested types
    pub enclosing: Option<usize>,
    /// Generic parameters
    pub generic_params: Vec<GenericParam>,
    /// Fields, in table order
    pub fields: Vec<FieldDef>,
    /// Methods, in table order
    pub methods: Vec<MethodDef>,
    /// Attached custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// Token as last read or assigned
    pub token: Token,
}

impl TypeDef {
    /// Create an empty type.
    #[must_use]
    pub fn new(namespace: &str, name: &str, flags: TypeAttributes, extends: Option<TypeHandle>) -> Self {
        TypeDef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            extends,
            enclosing: None,
            generic_params: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            custom_attributes: Vec::new(),
            token: Token::default(),
        }
    }

    /// Index of the first method called `name`.
    #[must_use]
    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|m| m.name == name)
    }

    /// Index of the field called `name`.
    #[must_use]
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

/// A module with its assembly manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDef {
    /// Assembly simple name
    pub name: String,
    /// Assembly version
    pub version: Version,
    /// Module version id, regenerated on every write
    pub mvid: Guid,
    /// Referenced assemblies
    pub assembly_refs: Vec<AssemblyRef>,
    /// Referenced types
    pub type_refs: Vec<TypeRef>,
    /// Type specifications (generic instances and other constructed types)
    pub type_specs: Vec<TypeSig>,
    /// Member references
    pub member_refs: Vec<MemberRef>,
    /// Type definitions in table order; index 0 is the `<Module>` type
    pub types: Vec<TypeDef>,
    /// `true` if sequence points were loaded from a symbol file
    pub has_symbols: bool,
}

impl ModuleDef {
    /// Create an empty module containing only the `<Module>` type.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut module = ModuleDef {
            name: name.to_string(),
            version: Version::new(1, 0, 0, 0),
            mvid: Guid::ZERO,
            assembly_refs: Vec::new(),
            type_refs: Vec::new(),
            type_specs: Vec::new(),
            member_refs: Vec::new(),
            types: vec![TypeDef::new("", MODULE_TYPE_NAME, TypeAttributes::empty(), None)],
            has_symbols: false,
        };
        module.assign_tokens();
        module
    }

    /// Recompute the tokens of every definition from its position.
    ///
    /// Rows are numbered in the order the writer emits them: types in vector order, and the
    /// fields and methods of each type contiguously after those of the previous type.
    pub fn assign_tokens(&mut self) {
        let mut field_row = 1u32;
        let mut method_row = 1u32;
        for (index, ty) in self.types.iter_mut().enumerate() {
            ty.token = Token::from_parts(TableId::TypeDef as u8, row_of(index));
            for field in &mut ty.fields {
                field.token = Token::from_parts(TableId::Field as u8, field_row);
                field_row += 1;
            }
            for method in &mut ty.methods {
                method.token = Token::from_parts(TableId::MethodDef as u8, method_row);
                method_row += 1;
            }
        }
    }

    /// The type at `index`.
    ///
    /// # Errors
    /// Returns [`Error::TypeNotFound`] if the index is out of range.
    pub fn type_def(&self, index: usize) -> Result<&TypeDef> {
        self.types
            .get(index)
            .ok_or_else(|| Error::TypeNotFound(format!("TypeDef #{index}")))
    }

    /// The method at `id`.
    ///
    /// # Errors
    /// Returns an error if the id does not address a method.
    pub fn method(&self, id: MethodId) -> Result<&MethodDef> {
        self.types
            .get(id.ty)
            .and_then(|t| t.methods.get(id.index))
            .ok_or_else(|| Error::Error(format!("No method at {id:?}")))
    }

    /// Mutable access to the method at `id`.
    ///
    /// # Errors
    /// Returns an error if the id does not address a method.
    pub fn method_mut(&mut self, id: MethodId) -> Result<&mut MethodDef> {
        self.types
            .get_mut(id.ty)
            .and_then(|t| t.methods.get_mut(id.index))
            .ok_or_else(|| Error::Error(format!("No method at {id:?}")))
    }

    /// The field at `id`.
    ///
    /// # Errors
    /// Returns an error if the id does not address a field.
    pub fn field(&self, id: FieldId) -> Result<&FieldDef> {
        self.types
            .get(id.ty)
            .and_then(|t| t.fields.get(id.index))
            .ok_or_else(|| Error::Error(format!("No field at {id:?}")))
    }

    /// Every method id, in table order.
    pub fn method_ids(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.types.iter().enumerate().flat_map(|(ty, def)| {
            (0..def.methods.len()).map(move |index| MethodId { ty, index })
        })
    }

    /// Find the method definition carrying `token`.
    #[must_use]
    pub fn method_by_token(&self, token: Token) -> Option<MethodId> {
        self.method_ids()
            .find(|id| self.types[id.ty].methods[id.index].token == token)
    }

    /// Indices of the types directly nested in `enclosing`.
    pub fn nested_types(&self, enclosing: usize) -> impl Iterator<Item = usize> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter(move |(_, t)| t.enclosing == Some(enclosing))
            .map(|(i, _)| i)
    }

    /// Indices of all top-level types.
    pub fn top_level_types(&self) -> impl Iterator<Item = usize> + '_ {
        self.types
            .iter()
            .enumerate()
            .filter(|(_, t)| t.enclosing.is_none())
            .map(|(i, _)| i)
    }

    /// Find a top-level type definition by namespace and name.
    #[must_use]
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<usize> {
        self.top_level_types()
            .find(|&i| self.types[i].namespace == namespace && self.types[i].name == name)
    }

    /// Find a type definition nested in `enclosing` by name.
    #[must_use]
    pub fn find_nested_type(&self, enclosing: usize, name: &str) -> Option<usize> {
        self.nested_types(enclosing)
            .find(|&i| self.types[i].name == name)
    }

    /// Append a type definition and return its index.
    pub fn add_type(&mut self, ty: TypeDef) -> usize {
        self.types.push(ty);
        self.types.len() - 1
    }

    /// Append a method to type `ty` and return its id.
    ///
    /// # Errors
    /// Returns an error if `ty` is out of range.
    pub fn add_method(&mut self, ty: usize, method: MethodDef) -> Result<MethodId> {
        let owner = self
            .types
            .get_mut(ty)
            .ok_or_else(|| Error::TypeNotFound(format!("TypeDef #{ty}")))?;
        owner.methods.push(method);
        Ok(MethodId {
            ty,
            index: owner.methods.len() - 1,
        })
    }

    /// Append a field to type `ty` and return its id.
    ///
    /// # Errors
    /// Returns an error if `ty` is out of range.
    pub fn add_field(&mut self, ty: usize, field: FieldDef) -> Result<FieldId> {
        let owner = self
            .types
            .get_mut(ty)
            .ok_or_else(|| Error::TypeNotFound(format!("TypeDef #{ty}")))?;
        owner.fields.push(field);
        Ok(FieldId {
            ty,
            index: owner.fields.len() - 1,
        })
    }

    /// Find or add an assembly reference by name.
    pub fn assembly_ref(&mut self, name: &str) -> usize {
        if let Some(index) = self.assembly_refs.iter().position(|a| a.name == name) {
            return index;
        }
        self.assembly_refs.push(AssemblyRef {
            name: name.to_string(),
            version: Version::new(4, 0, 0, 0),
        });
        self.assembly_refs.len() - 1
    }

    /// Find or add a type reference.
    pub fn type_ref(&mut self, scope: ResolutionScope, namespace: &str, name: &str) -> TypeHandle {
        if let Some(index) = self
            .type_refs
            .iter()
            .position(|r| r.scope == scope && r.namespace == namespace && r.name == name)
        {
            return TypeHandle::Ref(index);
        }
        self.type_refs.push(TypeRef {
            scope,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        TypeHandle::Ref(self.type_refs.len() - 1)
    }

    /// Find or add a reference to a top-level base library type.
    pub fn corlib_type(&mut self, namespace: &str, name: &str) -> TypeHandle {
        if self.name == CORLIB_NAME {
            if let Some(index) = self.find_type(namespace, name) {
                return TypeHandle::Def(index);
            }
        }
        let corlib = self.assembly_ref(CORLIB_NAME);
        self.type_ref(ResolutionScope::AssemblyRef(corlib), namespace, name)
    }

    /// Find or add a type specification.
    pub fn type_spec(&mut self, signature: TypeSig) -> TypeHandle {
        if let Some(index) = self.type_specs.iter().position(|s| *s == signature) {
            return TypeHandle::Spec(index);
        }
        self.type_specs.push(signature);
        TypeHandle::Spec(self.type_specs.len() - 1)
    }

    /// Find or add a member reference.
    pub fn member_ref(&mut self, parent: TypeHandle, name: &str, signature: MemberSig) -> usize {
        if let Some(index) = self
            .member_refs
            .iter()
            .position(|m| m.parent == parent && m.name == name && m.signature == signature)
        {
            return index;
        }
        self.member_refs.push(MemberRef {
            parent,
            name: name.to_string(),
            signature,
        });
        self.member_refs.len() - 1
    }

    /// The method signature behind a method handle.
    ///
    /// # Errors
    /// Returns an error if the handle is dangling or names a field.
    pub fn method_sig(&self, handle: MethodHandle) -> Result<&MethodSig> {
        match handle {
            MethodHandle::Def(id) => Ok(&self.method(id)?.signature),
            MethodHandle::Ref(index) => match self.member_refs.get(index) {
                Some(MemberRef {
                    signature: MemberSig::Method(sig),
                    ..
                }) => Ok(sig),
                _ => Err(malformed_error!("MemberRef #{} is not a method", index)),
            },
        }
    }

    /// Name of the method behind a handle.
    ///
    /// # Errors
    /// Returns an error if the handle is dangling.
    pub fn method_name(&self, handle: MethodHandle) -> Result<&str> {
        match handle {
            MethodHandle::Def(id) => Ok(&self.method(id)?.name),
            MethodHandle::Ref(index) => self
                .member_refs
                .get(index)
                .map(|m| m.name.as_str())
                .ok_or_else(|| malformed_error!("Dangling MemberRef #{}", index)),
        }
    }

    /// Declaring type of the method behind a handle.
    ///
    /// # Errors
    /// Returns an error if the handle is dangling.
    pub fn method_parent(&self, handle: MethodHandle) -> Result<TypeHandle> {
        match handle {
            MethodHandle::Def(id) => Ok(TypeHandle::Def(id.ty)),
            MethodHandle::Ref(index) => self
                .member_refs
                .get(index)
                .map(|m| m.parent)
                .ok_or_else(|| malformed_error!("Dangling MemberRef #{}", index)),
        }
    }

    /// Namespace and name of a type handle, walking a spec to its generic base.
    ///
    /// # Errors
    /// Returns an error if the handle is dangling or names a non-nominal spec.
    pub fn type_name(&self, handle: TypeHandle) -> Result<(&str, &str)> {
        match handle {
            TypeHandle::Def(index) => {
                let ty = self.type_def(index)?;
                Ok((&ty.namespace, &ty.name))
            }
            TypeHandle::Ref(index) => {
                let ty = self
                    .type_refs
                    .get(index)
                    .ok_or_else(|| malformed_error!("Dangling TypeRef #{}", index))?;
                Ok((&ty.namespace, &ty.name))
            }
            TypeHandle::Spec(index) => match self.type_specs.get(index) {
                Some(TypeSig::GenericInst { base, .. }) => self.type_name(*base),
                _ => Err(malformed_error!("TypeSpec #{} has no name", index)),
            },
        }
    }

    /// Dotted full name of a type handle, nested types joined with `/`.
    #[must_use]
    pub fn type_full_name(&self, handle: TypeHandle) -> String {
        match handle {
            TypeHandle::Def(index) => match self.types.get(index) {
                Some(ty) => match ty.enclosing {
                    Some(outer) => format!("{}/{}", self.type_full_name(TypeHandle::Def(outer)), ty.name),
                    None => join_name(&ty.namespace, &ty.name),
                },
                None => format!("<TypeDef #{index}>"),
            },
            TypeHandle::Ref(index) => match self.type_refs.get(index) {
                Some(ty) => match ty.scope {
                    ResolutionScope::TypeRef(outer) => {
                        format!("{}/{}", self.type_full_name(TypeHandle::Ref(outer)), ty.name)
                    }
                    _ => join_name(&ty.namespace, &ty.name),
                },
                None => format!("<TypeRef #{index}>"),
            },
            TypeHandle::Spec(index) => match self.type_specs.get(index) {
                Some(TypeSig::GenericInst { base, .. }) => self.type_full_name(*base),
                _ => format!("<TypeSpec #{index}>"),
            },
        }
    }

    /// `true` if the method carries a custom attribute whose type is `namespace.name`.
    #[must_use]
    pub fn has_attribute(&self, attributes: &[CustomAttribute], namespace: &str, name: &str) -> bool {
        attributes.iter().any(|attr| {
            self.method_parent(attr.ctor)
                .and_then(|parent| self.type_name(parent))
                .is_ok_and(|(ns, n)| ns == namespace && n == name)
        })
    }
}

fn join_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

fn row_of(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(0x00FF_FFFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleDef {
        let mut module = ModuleDef::new("Game");
        let object = module.corlib_type("System", "Object");
        let outer = module.add_type(TypeDef::new("Demo", "Outer", TypeAttributes::PUBLIC, Some(object)));
        let mut inner = TypeDef::new("", "Inner", TypeAttributes::NESTED_PUBLIC, Some(object));
        inner.enclosing = Some(outer);
        module.add_type(inner);
        module
            .add_method(
                outer,
                MethodDef::new("Run", MethodAttributes::PUBLIC, MethodSig::instance(TypeSig::Void, vec![])),
            )
            .unwrap();
        module
            .add_field(outer, FieldDef::new("count", FieldAttributes::PRIVATE, TypeSig::I4))
            .unwrap();
        module.assign_tokens();
        module
    }

    #[test]
    fn tokens_follow_table_order() {
        let module = sample();
        assert_eq!(module.types[0].token, Token(0x0200_0001));
        assert_eq!(module.types[1].token, Token(0x0200_0002));
        assert_eq!(module.types[1].methods[0].token, Token(0x0600_0001));
        assert_eq!(module.types[1].fields[0].token, Token(0x0400_0001));
        assert_eq!(
            module.method_by_token(Token(0x0600_0001)),
            Some(MethodId { ty: 1, index: 0 })
        );
    }

    #[test]
    fn references_are_deduplicated() {
        let mut module = sample();
        let a = module.corlib_type("System", "String");
        let b = module.corlib_type("System", "String");
        assert_eq!(a, b);
        assert_eq!(module.assembly_refs.len(), 1);
        let sig = TypeSig::SzArray(Box::new(TypeSig::I4));
        assert_eq!(module.type_spec(sig.clone()), module.type_spec(sig));
    }

    #[test]
    fn nesting_and_names() {
        let module = sample();
        assert_eq!(module.find_type("Demo", "Outer"), Some(1));
        assert_eq!(module.find_nested_type(1, "Inner"), Some(2));
        assert_eq!(module.find_type("", "Inner"), None);
        assert_eq!(module.type_full_name(TypeHandle::Def(2)), "Demo.Outer/Inner");
        assert_eq!(module.type_full_name(TypeHandle::Ref(0)), "System.Object");
    }
}
