//! Installing replacements into woven methods of a loaded process.
//!
//! The [`InjectionDriver`] owns the per-assembly installation state. Installing a descriptor
//! finds, by the marker's stable token and the generated names:
//!
//! - the static delegate field of the target method
//! - the clone of the original body
//!
//! then builds a delegate over the clone, hands it to the descriptor's transform, and combines
//! the replacement in front of whatever the field already holds. Once the field is set, calls
//! of the woven method dispatch through it.
//!
//! Each assembly moves through [`InstallState`]: `NotRegistered`, then `Installed` on the first
//! install, then `Uninstalled` once its fields are reset. Installing an installed assembly does
//! nothing. [`InjectionDriver::auto_install`] installs every loaded assembly once; assemblies
//! loaded later are installed by name with [`InjectionDriver::install`].
//!
//! # Thread Safety
//!
//! Installation state and the descriptor registry live in [`DashMap`]s and delegate fields are
//! written under their slot lock, so installs of different assemblies can run concurrently from
//! a shared driver.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dotweave::{driver::InjectionDriver, injection::{FnProvider, InjectionDescriptor, WeavingRecord}};
//! use dotweave::runtime::Runtime;
//!
//! let runtime = Arc::new(Runtime::with_search_paths(vec!["Managed".into()])?);
//! runtime.load_path("Managed/Game.dll".as_ref())?;
//!
//! let driver = InjectionDriver::new(Arc::clone(&runtime));
//! driver.catalog().register(Arc::new(FnProvider::new("Mods", |_| {
//!     let record = WeavingRecord::new("Game", "Game.Player", "Greet<System.String>");
//!     Ok(vec![InjectionDescriptor::intercept(record, |runtime, original, args| {
//!         original.invoke(runtime, args)
//!     })])
//! })))?;
//! driver.auto_install(true)?;
//! # Ok::<(), dotweave::Error>(())
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use dashmap::DashMap;

use crate::{
    injection::{InjectionDescriptor, ProviderCatalog, WeavingRecord},
    metadata::{model::MethodId, token::StableId},
    runtime::{
        delegate::{Callable, DelegateValue},
        value::Value,
        Runtime, RuntimeFieldId, RuntimeMethodId,
    },
    weaver::{marker, naming},
    Error, Result,
};

/// Installation state of one assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallState {
    /// Never installed
    #[default]
    NotRegistered,
    /// Descriptors are installed
    Installed,
    /// Installed once, then uninstalled
    Uninstalled,
}

/// Installs and uninstalls injection descriptors in a [`Runtime`].
pub struct InjectionDriver {
    runtime: Arc<Runtime>,
    catalog: ProviderCatalog,
    registry: DashMap<usize, Vec<Arc<InjectionDescriptor>>>,
    states: DashMap<usize, InstallState>,
    auto_installed: AtomicBool,
}

impl InjectionDriver {
    /// A driver over `runtime` with an empty provider catalog.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        InjectionDriver::with_catalog(runtime, ProviderCatalog::new())
    }

    /// A driver over `runtime` discovering descriptors through `catalog`.
    #[must_use]
    pub fn with_catalog(runtime: Arc<Runtime>, catalog: ProviderCatalog) -> Self {
        InjectionDriver {
            runtime,
            catalog,
            registry: DashMap::new(),
            states: DashMap::new(),
            auto_installed: AtomicBool::new(false),
        }
    }

    /// The runtime this driver installs into.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The provider catalog.
    #[must_use]
    pub fn catalog(&self) -> &ProviderCatalog {
        &self.catalog
    }

    /// Installation state of `assembly`.
    #[must_use]
    pub fn state(&self, assembly: usize) -> InstallState {
        self.states.get(&assembly).map_or(InstallState::NotRegistered, |s| *s)
    }

    /// `true` if any method of `assembly` carries the marker.
    ///
    /// # Errors
    /// Returns an error if `assembly` is not loaded.
    pub fn is_injected_assembly(&self, assembly: usize) -> Result<bool> {
        let module = self.runtime.module(assembly)?;
        Ok(module
            .method_ids()
            .filter_map(|id| module.method(id).ok())
            .any(|m| marker::is_woven(module, m)))
    }

    /// `true` if `method` carries the marker.
    ///
    /// # Errors
    /// Returns an error if `method` does not exist.
    pub fn is_injected_method(&self, method: RuntimeMethodId) -> Result<bool> {
        let module = self.runtime.module(method.assembly)?;
        Ok(marker::is_woven(module, self.runtime.method_def(method)?))
    }

    /// The stable token recorded by the marker of `method`.
    #[must_use]
    pub fn try_get_origin_token(&self, method: RuntimeMethodId) -> Option<StableId> {
        let module = self.runtime.module(method.assembly).ok()?;
        marker::stable_id(module, self.runtime.method_def(method).ok()?)
    }

    fn woven_identity(&self, method: RuntimeMethodId) -> Result<(String, StableId)> {
        let id = self.try_get_origin_token(method).ok_or_else(|| {
            Error::Installation(format!("{} is not woven", self.runtime.method_name(method)))
        })?;
        Ok((self.runtime.method_def(method)?.name.clone(), id))
    }

    /// The clone holding the original body of the woven `method`.
    ///
    /// # Errors
    /// Returns [`Error::Installation`] if `method` is not woven, or [`Error::MethodNotFound`] if
    /// the clone is missing.
    pub fn get_proxy_method(&self, method: RuntimeMethodId) -> Result<RuntimeMethodId> {
        let (name, id) = self.woven_identity(method)?;
        let origin = naming::origin_method_name(&name, id);
        let ty = method.declaring_type();
        let index = self.runtime.type_def(ty)?.method_index(&origin).ok_or_else(|| {
            Error::MethodNotFound {
                klass: self.runtime.type_name(ty),
                method: origin.clone(),
            }
        })?;
        Ok(RuntimeMethodId {
            assembly: method.assembly,
            method: MethodId { ty: ty.ty, index },
        })
    }

    /// The static delegate field of the woven `method`.
    ///
    /// # Errors
    /// Returns [`Error::Installation`] if `method` is not woven, or [`Error::FieldNotFound`] if
    /// the field is missing.
    pub fn delegate_field(&self, method: RuntimeMethodId) -> Result<RuntimeFieldId> {
        let (name, id) = self.woven_identity(method)?;
        self.runtime
            .find_field(method.declaring_type(), &naming::delegate_field_name(&name, id))
    }

    fn target_of(&self, record: &WeavingRecord) -> Result<RuntimeMethodId> {
        self.runtime
            .method_by_signature(&record.assembly_name, &record.klass_signature, &record.method_signature)
    }

    /// The default install action: combine the descriptor's replacement into the field.
    ///
    /// # Errors
    /// Returns an error if the target, its field or its clone cannot be found, or the transform
    /// fails.
    pub fn install_descriptor(&self, descriptor: &InjectionDescriptor) -> Result<()> {
        let target = self.target_of(descriptor.target())?;
        let field = self.delegate_field(target)?;
        let origin = self.get_proxy_method(target)?;
        let field_type = self
            .runtime
            .sig_type(field.assembly, &self.runtime.field_def(field)?.signature)?;

        let original = Arc::new(DelegateValue::new(
            field_type,
            Callable::Method {
                target: None,
                method: origin,
            },
        ));
        let replacement = Arc::new(descriptor.replacement(original)?.retype(field_type));

        let slot = self.runtime.static_slot(field)?;
        let mut value = write_lock!(slot);
        let current = value.as_delegate().cloned();
        *value = DelegateValue::combine(Some(&replacement), current.as_ref())?
            .map_or(Value::Null, Value::Delegate);
        log::debug!("Installed {}", descriptor.target());
        Ok(())
    }

    /// Install `descriptors` into `assembly`. An assembly that is already installed is left
    /// alone.
    ///
    /// Every descriptor is attempted, in order. Each one runs its custom install action if it
    /// has one and [`InjectionDriver::install_descriptor`] otherwise.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use std::sync::Arc;
    /// use dotweave::{
    ///     driver::{InjectionDriver, InstallState},
    ///     injection::{InjectionDescriptor, WeavingRecord},
    ///     runtime::Runtime,
    /// };
    ///
    /// let runtime = Arc::new(Runtime::new()?);
    /// let game = runtime.load_path("Managed/Game.dll".as_ref())?;
    /// let driver = InjectionDriver::new(Arc::clone(&runtime));
    ///
    /// let record = WeavingRecord::new("Game", "Game.Player", "Greet<System.String>");
    /// let hook = InjectionDescriptor::intercept(record, |runtime, original, args| {
    ///     original.invoke(runtime, args)
    /// });
    /// driver.install_assembly(game, &[Arc::new(hook)])?;
    /// assert_eq!(driver.state(game), InstallState::Installed);
    ///
    /// // A second install of the same assembly is a no-op
    /// driver.install_assembly(game, &[])?;
    /// # Ok::<(), dotweave::Error>(())
    /// ```
    ///
    /// # Thread Safety
    ///
    /// Safe to call from several threads. The check and the transition to
    /// [`InstallState::Installed`] happen under the state map's entry lock, so one caller wins
    /// and the others return `Ok(())` without installing.
    ///
    /// # Errors
    /// Returns [`Error::AssemblyInstallation`] listing every failed descriptor, or a resolution
    /// error if `assembly` is not loaded.
    pub fn install_assembly(&self, assembly: usize, descriptors: &[Arc<InjectionDescriptor>]) -> Result<()> {
        let name = self.runtime.assembly(assembly)?.name().to_string();
        {
            let mut state = self.states.entry(assembly).or_default();
            if *state == InstallState::Installed {
                log::debug!("Assembly {name} is already installed");
                return Ok(());
            }
            *state = InstallState::Installed;
        }
        log::info!("Installing {} injection(s) into {name}", descriptors.len());
        self.registry.insert(assembly, descriptors.to_vec());

        let mut errors = Vec::new();
        for descriptor in descriptors {
            let result = match descriptor.install_action() {
                Some(action) => action(self, descriptor),
                None => self.install_descriptor(descriptor),
            };
            if let Err(error) = result {
                log::error!("Installing {} failed: {error}", descriptor.target());
                errors.push(error);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::AssemblyInstallation { assembly: name, errors })
        }
    }

    /// Install the catalog's descriptors targeting the loaded assembly `name`.
    ///
    /// # Errors
    /// Returns a resolution error if `name` is not loaded, a provider error, or
    /// [`Error::AssemblyInstallation`].
    pub fn install(&self, name: &str) -> Result<()> {
        let assembly = self.runtime.assembly_by_name(name)?;
        let descriptors = self.catalog.descriptors_towards(&self.runtime, name)?;
        self.install_assembly(assembly, &descriptors)
    }

    /// Reset the delegate field of every target installed into `assembly`.
    ///
    /// # Errors
    /// Returns [`Error::AssemblyInstallation`] listing every field that could not be reset.
    pub fn uninstall_assembly(&self, assembly: usize) -> Result<()> {
        let Some((_, descriptors)) = self.registry.remove(&assembly) else {
            return Ok(());
        };
        self.states.insert(assembly, InstallState::Uninstalled);

        let mut targets: Vec<&WeavingRecord> = descriptors.iter().map(|d| d.target()).collect();
        targets.sort();
        targets.dedup();

        let mut errors = Vec::new();
        for record in targets {
            let result = self.target_of(record).and_then(|target| {
                let field = self.delegate_field(target)?;
                *write_lock!(self.runtime.static_slot(field)?) = Value::Null;
                Ok(())
            });
            if let Err(error) = result {
                log::error!("Uninstalling {record} failed: {error}");
                errors.push(error);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::AssemblyInstallation {
                assembly: self.runtime.assembly(assembly)?.name().to_string(),
                errors,
            })
        }
    }

    /// Install every catalog descriptor whose target assembly is loaded.
    ///
    /// # Errors
    /// Returns a provider error, or the first [`Error::AssemblyInstallation`] after every
    /// assembly was attempted.
    pub fn install_all(&self) -> Result<()> {
        let mut groups: BTreeMap<String, Vec<Arc<InjectionDescriptor>>> = BTreeMap::new();
        for descriptor in self.catalog.all(&self.runtime)? {
            groups
                .entry(descriptor.target().assembly_name.clone())
                .or_default()
                .push(descriptor);
        }
        log::info!("Installing into {} involved assemblies", groups.len());

        let mut first_error = None;
        for (name, descriptors) in groups {
            if !self.runtime.is_loaded(&name) {
                log::debug!("Skipping {name}: not loaded");
                continue;
            }
            let result = self
                .runtime
                .assembly_by_name(&name)
                .and_then(|assembly| self.install_assembly(assembly, &descriptors));
            if let Err(error) = result {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Uninstall every installed assembly.
    ///
    /// # Errors
    /// Returns the first uninstall error after every assembly was attempted.
    pub fn uninstall_all(&self) -> Result<()> {
        let installed: Vec<usize> = self.registry.iter().map(|entry| *entry.key()).collect();
        let mut first_error = None;
        for assembly in installed {
            if let Err(error) = self.uninstall_assembly(assembly) {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// [`InjectionDriver::install_all`] once per driver.
    ///
    /// With `allow_failures` installation errors are logged instead of returned.
    ///
    /// # Errors
    /// Returns the installation error unless `allow_failures` is set.
    pub fn auto_install(&self, allow_failures: bool) -> Result<()> {
        if self.auto_installed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.install_all() {
            Err(error) if allow_failures => {
                log::error!("Automatic installation failed: {error}");
                Ok(())
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for InjectionDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InjectionDriver")
            .field("installed", &self.registry.len())
            .field("catalog", &self.catalog)
            .finish_non_exhaustive()
    }
}
