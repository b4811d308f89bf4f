//! The loaded process: assemblies, type resolution, statics and execution.
//!
//! A [`Runtime`] plays the role of the process the woven assemblies are loaded into. It loads
//! module images, resolves references between them on demand, keeps static field storage and
//! executes CIL through an interpreter. The base class library is synthesized by
//! [`crate::corlib::build`] and always occupies assembly index 0.
//!
//! # Architecture
//!
//! - [`types`] - resolution of type, method and field references across assemblies
//! - [`value`] - the value model: stack values, slots, objects and arrays
//! - [`delegate`] - delegate values with multicast invocation lists
//! - [`intrinsics`] - native implementations of `internalcall` base library members
//! - [`interpreter`] - the CIL interpreter with exception handling
//!
//! Loaded assemblies live in an append-only [`boxcar::Vec`], so references handed out by
//! [`Runtime::module`] stay valid while more assemblies are loaded. Statics are per-field
//! [`value::Slot`]s in a [`DashMap`]; writers hold the slot's lock across read-modify-write.
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotweave::runtime::{Runtime, Value};
//! use std::path::Path;
//!
//! let runtime = Runtime::new()?;
//! let game = runtime.load_path(Path::new("Game.dll"))?;
//! runtime.verify(game)?;
//! let method = runtime.method_by_signature("Game", "Game.Player", "Heal<System.Int32>")?;
//! let result = runtime.invoke(method, vec![Value::Null, Value::I4(5)])?;
//! println!("{result}");
//! # Ok::<(), dotweave::Error>(())
//! ```

pub mod delegate;
pub mod interpreter;
pub mod intrinsics;
pub mod types;
pub mod value;

pub use delegate::{Callable, DelegateValue, NativeFn};
pub use interpreter::Completion;
pub use value::{slot, ArrayValue, Object, Slot, Value};

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use dashmap::DashMap;

use crate::{
    corlib,
    metadata::model::{FieldDef, FieldId, MethodDef, MethodId, ModuleDef, TypeDef},
    Error, Result,
};

/// Index of the base class library in every runtime.
pub const CORLIB_INDEX: usize = 0;

/// A type definition of a loaded assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeTypeId {
    /// Index of the loaded assembly
    pub assembly: usize,
    /// Index into the module's types
    pub ty: usize,
}

/// A method definition of a loaded assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeMethodId {
    /// Index of the loaded assembly
    pub assembly: usize,
    /// Position in the module
    pub method: MethodId,
}

impl RuntimeMethodId {
    /// The declaring type.
    #[must_use]
    pub fn declaring_type(&self) -> RuntimeTypeId {
        RuntimeTypeId {
            assembly: self.assembly,
            ty: self.method.ty,
        }
    }
}

/// A field definition of a loaded assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuntimeFieldId {
    /// Index of the loaded assembly
    pub assembly: usize,
    /// Position in the module
    pub field: FieldId,
}

impl RuntimeFieldId {
    /// The declaring type.
    #[must_use]
    pub fn declaring_type(&self) -> RuntimeTypeId {
        RuntimeTypeId {
            assembly: self.assembly,
            ty: self.field.ty,
        }
    }
}

/// An assembly loaded into a [`Runtime`].
#[derive(Debug)]
pub struct LoadedAssembly {
    index: usize,
    module: ModuleDef,
    path: Option<PathBuf>,
    pub(crate) type_refs: DashMap<usize, RuntimeTypeId>,
    pub(crate) method_refs: DashMap<usize, RuntimeMethodId>,
    pub(crate) field_refs: DashMap<usize, RuntimeFieldId>,
}

impl LoadedAssembly {
    /// Position in the runtime.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The module.
    #[must_use]
    pub fn module(&self) -> &ModuleDef {
        &self.module
    }

    /// Assembly simple name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.module.name
    }

    /// File the assembly was loaded from, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// The loaded process.
pub struct Runtime {
    assemblies: boxcar::Vec<Arc<LoadedAssembly>>,
    by_name: DashMap<String, usize>,
    search_paths: Vec<PathBuf>,
    allowed: Vec<PathBuf>,
    pub(crate) statics: DashMap<RuntimeFieldId, Slot>,
    pub(crate) initialized: DashMap<RuntimeTypeId, ()>,
    load_lock: Mutex<()>,
}

impl Runtime {
    /// A runtime holding only the base class library.
    ///
    /// # Errors
    /// Returns an error if the base class library cannot be built.
    pub fn new() -> Result<Runtime> {
        Runtime::with_search_paths(Vec::new())
    }

    /// A runtime that probes `search_paths` for `<name>.dll` when a reference names an assembly
    /// that is not loaded yet.
    ///
    /// # Errors
    /// Returns an error if the base class library cannot be built.
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Result<Runtime> {
        Runtime::build(search_paths, Vec::new())
    }

    /// A runtime that loads a referenced assembly only from the file of `allowed` whose stem is
    /// its name, first entry wins. Nothing else on disk is visible to it.
    ///
    /// # Errors
    /// Returns an error if the base class library cannot be built.
    pub fn with_allowed_assemblies(allowed: Vec<PathBuf>) -> Result<Runtime> {
        Runtime::build(Vec::new(), allowed)
    }

    fn build(search_paths: Vec<PathBuf>, allowed: Vec<PathBuf>) -> Result<Runtime> {
        let runtime = Runtime {
            assemblies: boxcar::Vec::new(),
            by_name: DashMap::new(),
            search_paths,
            allowed,
            statics: DashMap::new(),
            initialized: DashMap::new(),
            load_lock: Mutex::new(()),
        };
        let index = runtime.load_module(corlib::build()?, None)?;
        debug_assert_eq!(index, CORLIB_INDEX);
        Ok(runtime)
    }

    /// Load the image at `path`. An assembly of the same name that is already loaded is
    /// returned instead.
    ///
    /// # Errors
    /// Returns an error if the image cannot be read.
    pub fn load_path(&self, path: &Path) -> Result<usize> {
        let module = ModuleDef::from_path(path)?;
        self.load_module(module, Some(path.to_path_buf()))
    }

    /// Load an in-memory module. An assembly of the same name that is already loaded is
    /// returned instead.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] if the load lock is poisoned.
    pub fn load_module(&self, module: ModuleDef, path: Option<PathBuf>) -> Result<usize> {
        let _guard = lock!(self.load_lock);
        if let Some(existing) = self.by_name.get(&module.name) {
            log::debug!("Assembly {} already loaded as #{}", module.name, *existing);
            return Ok(*existing);
        }

        let name = module.name.clone();
        let index = self.assemblies.count();
        self.assemblies.push(Arc::new(LoadedAssembly {
            index,
            module,
            path,
            type_refs: DashMap::new(),
            method_refs: DashMap::new(),
            field_refs: DashMap::new(),
        }));
        self.by_name.insert(name.clone(), index);
        log::debug!("Loaded assembly {name} as #{index}");
        Ok(index)
    }

    /// The loaded assembly called `name`, loading it from the allowed files or the search
    /// paths if needed.
    ///
    /// # Errors
    /// Returns [`Error::AssemblyNotFound`] if no such assembly is loaded or can be found.
    pub fn assembly_by_name(&self, name: &str) -> Result<usize> {
        if let Some(index) = self.by_name.get(name) {
            return Ok(*index);
        }
        if let Some(path) = self
            .allowed
            .iter()
            .find(|path| path.file_stem().is_some_and(|stem| stem == name))
        {
            return self.load_path(path);
        }
        for dir in &self.search_paths {
            let candidate = dir.join(format!("{name}.dll"));
            if candidate.is_file() {
                return self.load_path(&candidate);
            }
        }
        Err(Error::AssemblyNotFound(name.to_string()))
    }

    /// The loaded assembly at `index`.
    ///
    /// # Errors
    /// Returns [`Error::AssemblyNotFound`] if the index is out of range.
    pub fn assembly(&self, index: usize) -> Result<&Arc<LoadedAssembly>> {
        self.assemblies
            .get(index)
            .ok_or_else(|| Error::AssemblyNotFound(format!("#{index}")))
    }

    /// The module of the loaded assembly at `index`.
    ///
    /// # Errors
    /// Returns [`Error::AssemblyNotFound`] if the index is out of range.
    pub fn module(&self, index: usize) -> Result<&ModuleDef> {
        Ok(self.assembly(index)?.module())
    }

    /// Every loaded assembly, in load order.
    pub fn assemblies(&self) -> impl Iterator<Item = &Arc<LoadedAssembly>> + '_ {
        self.assemblies.iter().map(|(_, assembly)| assembly)
    }

    /// `true` if an assembly called `name` is loaded.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// The type definition behind `id`.
    ///
    /// # Errors
    /// Returns an error if the id does not address a loaded type.
    pub fn type_def(&self, id: RuntimeTypeId) -> Result<&TypeDef> {
        self.module(id.assembly)?.type_def(id.ty)
    }

    /// The method definition behind `id`.
    ///
    /// # Errors
    /// Returns an error if the id does not address a loaded method.
    pub fn method_def(&self, id: RuntimeMethodId) -> Result<&MethodDef> {
        self.module(id.assembly)?.method(id.method)
    }

    /// The field definition behind `id`.
    ///
    /// # Errors
    /// Returns an error if the id does not address a loaded field.
    pub fn field_def(&self, id: RuntimeFieldId) -> Result<&FieldDef> {
        self.module(id.assembly)?.field(id.field)
    }

    /// Dotted full name of a loaded type, nested types joined with `/`.
    #[must_use]
    pub fn type_name(&self, id: RuntimeTypeId) -> String {
        match self.module(id.assembly) {
            Ok(module) => module.type_full_name(crate::metadata::TypeHandle::Def(id.ty)),
            Err(_) => format!("<type {id:?}>"),
        }
    }

    /// `Type::Method` for diagnostics.
    #[must_use]
    pub fn method_name(&self, id: RuntimeMethodId) -> String {
        let name = self
            .method_def(id)
            .map_or_else(|_| format!("{:?}", id.method), |m| m.name.clone());
        format!("{}::{}", self.type_name(id.declaring_type()), name)
    }

    /// Find a method by assembly name and structural signatures.
    ///
    /// # Errors
    /// Returns a resolution error if the assembly, type or method does not exist.
    pub fn method_by_signature(
        &self,
        assembly: &str,
        klass_signature: &str,
        method_signature: &str,
    ) -> Result<RuntimeMethodId> {
        let assembly = self.assembly_by_name(assembly)?;
        crate::signature::runtime::find_method(self, assembly, klass_signature, method_signature)
    }

    /// Call `method` from host code.
    ///
    /// Instance methods take the receiver as first argument.
    ///
    /// # Errors
    /// Returns [`Error::ManagedException`] if the method throws, or an execution error.
    pub fn invoke(&self, method: RuntimeMethodId, args: Vec<Value>) -> Result<Value> {
        let completion = self.call(method, args)?;
        self.complete(completion)
    }

    /// Turn a completion into a host result.
    ///
    /// # Errors
    /// Returns [`Error::ManagedException`] for a thrown exception.
    pub fn complete(&self, completion: Completion) -> Result<Value> {
        match completion {
            Completion::Return(value) => Ok(value),
            Completion::Throw(exception) => Err(Error::ManagedException(self.describe_exception(&exception))),
        }
    }

    /// Read a static field, running the class constructor first.
    ///
    /// # Errors
    /// Returns an error if the field does not exist or its type initializer fails.
    pub fn get_static(&self, field: RuntimeFieldId) -> Result<Value> {
        let slot = self.static_slot(field)?;
        let value = read_lock!(slot).clone();
        Ok(value)
    }

    /// Write a static field, running the class constructor first.
    ///
    /// # Errors
    /// Returns an error if the field does not exist or its type initializer fails.
    pub fn set_static(&self, field: RuntimeFieldId, value: Value) -> Result<()> {
        let slot = self.static_slot(field)?;
        *write_lock!(slot) = value;
        Ok(())
    }

    /// The storage of a static field, created with its default value on first use.
    ///
    /// # Errors
    /// Returns an error if the field does not exist or its type initializer fails.
    pub fn static_slot(&self, field: RuntimeFieldId) -> Result<Slot> {
        self.ensure_initialized(field.declaring_type())?;
        if let Some(existing) = self.statics.get(&field) {
            return Ok(Arc::clone(&existing));
        }
        let def = self.field_def(field)?;
        let default = self.default_value(field.assembly, &def.signature)?;
        Ok(Arc::clone(
            &self.statics.entry(field).or_insert_with(|| slot(default)),
        ))
    }

    /// `Type: message` of a managed exception object.
    #[must_use]
    pub fn describe_exception(&self, exception: &Value) -> String {
        match exception {
            Value::Object(object) => {
                let message = self
                    .exception_message(object)
                    .unwrap_or_default();
                format!("{}: {}", self.type_name(object.ty), message)
            }
            other => format!("non-exception value thrown: {other}"),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field(
                "assemblies",
                &self.assemblies().map(|a| a.name().to_string()).collect::<Vec<_>>(),
            )
            .field("statics", &self.statics.len())
            .finish()
    }
}
