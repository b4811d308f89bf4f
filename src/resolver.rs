//! Resolution of assembly names to module images during a weaving pass.
//!
//! An [`AssemblyResolver`] is seeded with the ordered allow-list of assembly files a pass may
//! touch. Names match the file stem, first entry wins. Resolved images are cached by name for
//! the lifetime of the resolver, so every lookup of one name within a pass yields the same
//! [`Arc`]. The files stay memory-mapped while cached and are released when the resolver is
//! dropped.
//!
//! The base class library is always resolvable, from the allow-list if it names one and from
//! the built-in definition otherwise.
//!
//! A weaving pass checks every type and member reference it adds with
//! [`AssemblyResolver::locate_type`] and [`AssemblyResolver::locate_member`], which probe the
//! referenced assemblies through [`AssemblyResolver::find_assembly`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotweave::resolver::AssemblyResolver;
//! use std::path::PathBuf;
//!
//! let resolver = AssemblyResolver::new(vec![PathBuf::from("Managed/Game.dll")]);
//! let game = resolver.resolve("Game")?;
//! println!("{} types", game.module().types.len());
//! assert!(resolver.find_assembly("Missing").is_none());
//! # Ok::<(), dotweave::Error>(())
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;

use crate::{
    corlib,
    file::File,
    metadata::{
        image::read_image,
        model::{MemberSig, ModuleDef, ResolutionScope, TypeHandle, CORLIB_NAME},
        signatures::TypeSig,
    },
    Error, Result,
};

/// A module image resolved by name.
#[derive(Debug)]
pub struct ResolvedAssembly {
    name: String,
    file: Option<File>,
    module: ModuleDef,
}

impl ResolvedAssembly {
    /// The name the assembly was resolved under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parsed module.
    #[must_use]
    pub fn module(&self) -> &ModuleDef {
        &self.module
    }

    /// The file the module was read from; `None` for the built-in base class library.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().and_then(File::path)
    }

    /// `true` while the backing file is mapped.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.file.as_ref().is_some_and(File::is_mapped)
    }
}

/// Resolves assembly names against an allow-list of files.
#[derive(Debug)]
pub struct AssemblyResolver {
    allowed: Vec<PathBuf>,
    cache: DashMap<String, Arc<ResolvedAssembly>>,
}

impl AssemblyResolver {
    /// A resolver over `allowed`, in priority order.
    #[must_use]
    pub fn new(allowed: Vec<PathBuf>) -> Self {
        AssemblyResolver {
            allowed,
            cache: DashMap::new(),
        }
    }

    /// The allow-list.
    #[must_use]
    pub fn allowed(&self) -> &[PathBuf] {
        &self.allowed
    }

    /// The allowed file whose stem is `name`.
    #[must_use]
    pub fn path_of(&self, name: &str) -> Option<&Path> {
        self.allowed
            .iter()
            .find(|path| path.file_stem().is_some_and(|stem| stem == name))
            .map(PathBuf::as_path)
    }

    /// Resolve `name`, reading and caching its image on first use.
    ///
    /// # Errors
    /// Returns [`Error::AssemblyNotFound`] if no allowed file carries that name, or the read
    /// error if the file is not a valid image.
    pub fn resolve(&self, name: &str) -> Result<Arc<ResolvedAssembly>> {
        if let Some(hit) = self.cache.get(name) {
            return Ok(Arc::clone(&hit));
        }

        let entry = self
            .cache
            .entry(name.to_string())
            .or_try_insert_with(|| self.load(name).map(Arc::new))?;
        Ok(Arc::clone(&entry))
    }

    /// Resolve `name`, reporting failure as `None`.
    ///
    /// Weaving passes probe the assemblies their new references point at through this call.
    #[must_use]
    pub fn find_assembly(&self, name: &str) -> Option<Arc<ResolvedAssembly>> {
        match self.resolve(name) {
            Ok(assembly) => Some(assembly),
            Err(e) => {
                log::debug!("Assembly {name} not resolvable: {e}");
                None
            }
        }
    }

    /// Number of cached assemblies.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Find the definition behind a type reference of `module`.
    ///
    /// Returns the defining assembly and the index of the type in it. Definitions of `module`
    /// itself are not reported through this call; `TypeHandle::Def` and references scoped to
    /// the module yield `Ok(None)`.
    ///
    /// # Errors
    /// Returns a resolution error if the defining assembly or type cannot be found.
    pub fn locate_type(
        &self,
        module: &ModuleDef,
        handle: TypeHandle,
    ) -> Result<Option<(Arc<ResolvedAssembly>, usize)>> {
        let TypeHandle::Ref(index) = handle else {
            return Ok(None);
        };
        let reference = module
            .type_refs
            .get(index)
            .ok_or_else(|| malformed_error!("Dangling TypeRef #{}", index))?;
        let not_found = || Error::TypeNotFound(module.type_full_name(handle));

        match reference.scope {
            ResolutionScope::Module => Ok(None),
            ResolutionScope::AssemblyRef(target) => {
                let name = &module
                    .assembly_refs
                    .get(target)
                    .ok_or_else(|| malformed_error!("Dangling AssemblyRef #{}", target))?
                    .name;
                let assembly = self
                    .find_assembly(name)
                    .ok_or_else(|| Error::AssemblyNotFound(name.clone()))?;
                let ty = assembly
                    .module()
                    .find_type(&reference.namespace, &reference.name)
                    .ok_or_else(not_found)?;
                Ok(Some((assembly, ty)))
            }
            ResolutionScope::TypeRef(outer) => {
                let Some((assembly, outer)) = self.locate_type(module, TypeHandle::Ref(outer))? else {
                    return Ok(None);
                };
                let ty = assembly
                    .module()
                    .find_nested_type(outer, &reference.name)
                    .ok_or_else(not_found)?;
                Ok(Some((assembly, ty)))
            }
        }
    }

    /// Find the definition behind member reference `index` of `module`.
    ///
    /// References through an instantiated generic type are looked up on its definition. Members
    /// match by name and kind; overloads are not told apart. References whose declaring type is
    /// defined by `module` itself yield `Ok(None)`.
    ///
    /// # Errors
    /// Returns a resolution error if the declaring assembly, type or member cannot be found.
    pub fn locate_member(
        &self,
        module: &ModuleDef,
        index: usize,
    ) -> Result<Option<(Arc<ResolvedAssembly>, usize)>> {
        let member = module
            .member_refs
            .get(index)
            .ok_or_else(|| malformed_error!("Dangling MemberRef #{}", index))?;
        let declaring = match member.parent {
            TypeHandle::Spec(spec) => match module.type_specs.get(spec) {
                Some(TypeSig::GenericInst { base, .. }) => *base,
                Some(_) => return Ok(None),
                None => return Err(malformed_error!("Dangling TypeSpec #{}", spec)),
            },
            handle => handle,
        };
        let Some((assembly, ty)) = self.locate_type(module, declaring)? else {
            return Ok(None);
        };

        let klass = module.type_full_name(declaring);
        let definition = &assembly.module().types[ty];
        match &member.signature {
            MemberSig::Method(_) if definition.method_index(&member.name).is_none() => {
                Err(Error::MethodNotFound {
                    klass,
                    method: member.name.clone(),
                })
            }
            MemberSig::Field(_) if definition.field_index(&member.name).is_none() => {
                Err(Error::FieldNotFound {
                    klass,
                    field: member.name.clone(),
                })
            }
            _ => Ok(Some((assembly, ty))),
        }
    }

    fn load(&self, name: &str) -> Result<ResolvedAssembly> {
        if let Some(path) = self.path_of(name) {
            let file = File::from_path(path)?;
            let module = read_image(file.data())?.module;
            log::debug!("Resolved {name} from {}", path.display());
            return Ok(ResolvedAssembly {
                name: name.to_string(),
                file: Some(file),
                module,
            });
        }
        if name == CORLIB_NAME {
            return Ok(ResolvedAssembly {
                name: name.to_string(),
                file: None,
                module: corlib::build()?,
            });
        }
        Err(Error::AssemblyNotFound(name.to_string()))
    }
}

impl Drop for AssemblyResolver {
    fn drop(&mut self) {
        if !self.cache.is_empty() {
            log::debug!("Releasing {} cached assemblies", self.cache.len());
        }
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{builder::TypeBuilder, signatures::MethodSig};

    fn write_module(dir: &Path, name: &str) -> PathBuf {
        let mut module = ModuleDef::new(name);
        let object = module.corlib_type("System", "Object");
        let outer = TypeBuilder::new("Lib", "Outer").extends(object).build(&mut module);
        TypeBuilder::new("", "Inner").extends(object).nested_in(outer).build(&mut module);
        let path = dir.join(format!("{name}.dll"));
        module.write_to(&path).unwrap();
        path
    }

    #[test]
    fn resolves_by_stem_with_stable_identity() {
        let dir = tempfile::tempdir().unwrap();
        let lib = write_module(dir.path(), "Lib");
        let resolver = AssemblyResolver::new(vec![lib.clone()]);

        let first = resolver.resolve("Lib").unwrap();
        let second = resolver.resolve("Lib").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_mapped());
        assert_eq!(first.path(), Some(lib.as_path()));
        assert_eq!(resolver.cached(), 1);
    }

    #[test]
    fn missing_assemblies() {
        let resolver = AssemblyResolver::new(Vec::new());
        assert!(matches!(resolver.resolve("Nope"), Err(Error::AssemblyNotFound(_))));
        assert!(resolver.find_assembly("Nope").is_none());

        let corlib = resolver.resolve(CORLIB_NAME).unwrap();
        assert!(!corlib.is_mapped());
        assert!(corlib.module().find_type("System", "Func`2").is_some());
    }

    #[test]
    fn locates_nested_references() {
        let dir = tempfile::tempdir().unwrap();
        let lib = write_module(dir.path(), "Lib");
        let resolver = AssemblyResolver::new(vec![lib]);

        let mut game = ModuleDef::new("Game");
        let scope = ResolutionScope::AssemblyRef(game.assembly_ref("Lib"));
        let TypeHandle::Ref(outer) = game.type_ref(scope, "Lib", "Outer") else {
            panic!("expected a reference");
        };
        let inner = game.type_ref(ResolutionScope::TypeRef(outer), "", "Inner");
        let missing = game.type_ref(scope, "Lib", "Missing");

        let (assembly, ty) = resolver.locate_type(&game, inner).unwrap().unwrap();
        assert_eq!(assembly.name(), "Lib");
        assert_eq!(assembly.module().types[ty].name, "Inner");
        assert!(matches!(
            resolver.locate_type(&game, missing),
            Err(Error::TypeNotFound(_))
        ));
        assert!(resolver.locate_type(&game, TypeHandle::Def(0)).unwrap().is_none());
    }

    #[test]
    fn locates_members_through_generic_instances() {
        let resolver = AssemblyResolver::new(Vec::new());
        let mut game = ModuleDef::new("Game");
        let func = game.corlib_type("System", "Func`2");
        let instance = game.type_spec(TypeSig::GenericInst {
            base: func,
            value_type: false,
            args: vec![TypeSig::String, TypeSig::String],
        });
        let invoke = game.member_ref(
            instance,
            "Invoke",
            MemberSig::Method(MethodSig::instance(TypeSig::Var(1), vec![TypeSig::Var(0)])),
        );
        let string = game.corlib_type("System", "String");
        let missing = game.member_ref(
            string,
            "DoesNotExist",
            MemberSig::Method(MethodSig::instance(TypeSig::Void, Vec::new())),
        );
        let field = game.member_ref(string, "Nope", MemberSig::Field(TypeSig::I4));

        let (assembly, ty) = resolver.locate_member(&game, invoke).unwrap().unwrap();
        assert_eq!(assembly.name(), CORLIB_NAME);
        assert_eq!(assembly.module().types[ty].name, "Func`2");
        assert!(matches!(
            resolver.locate_member(&game, missing),
            Err(Error::MethodNotFound { .. })
        ));
        assert!(matches!(
            resolver.locate_member(&game, field),
            Err(Error::FieldNotFound { .. })
        ));
        assert!(resolver.locate_member(&game, 99).is_err());
    }
}
