//! Discovery of injection descriptors.
//!
//! Code that wants to replace methods implements [`InjectionProvider`] and registers it with a
//! [`ProviderCatalog`]. Each provider belongs to the assembly that declares it; the catalog
//! caches the descriptors of every declaring assembly on first request.

use std::sync::{Arc, RwLock};

use dashmap::DashMap;

use crate::{
    injection::{descriptor::InjectionDescriptor, record::WeavingRecord},
    runtime::Runtime,
    Result,
};

/// A source of injection descriptors.
pub trait InjectionProvider: Send + Sync {
    /// Name of the assembly declaring this provider.
    fn assembly(&self) -> &str;

    /// The descriptors this provider contributes.
    ///
    /// # Errors
    /// Returns an error if a descriptor cannot be built, e.g. because its target is missing.
    fn provide(&self, runtime: &Runtime) -> Result<Vec<InjectionDescriptor>>;
}

type ProvideFn = dyn Fn(&Runtime) -> Result<Vec<InjectionDescriptor>> + Send + Sync;

/// A provider backed by a closure.
pub struct FnProvider {
    assembly: String,
    provide: Box<ProvideFn>,
}

impl FnProvider {
    /// A provider declared by `assembly`.
    pub fn new<F>(assembly: &str, provide: F) -> Self
    where
        F: Fn(&Runtime) -> Result<Vec<InjectionDescriptor>> + Send + Sync + 'static,
    {
        FnProvider {
            assembly: assembly.to_string(),
            provide: Box::new(provide),
        }
    }
}

impl InjectionProvider for FnProvider {
    fn assembly(&self) -> &str {
        &self.assembly
    }

    fn provide(&self, runtime: &Runtime) -> Result<Vec<InjectionDescriptor>> {
        (self.provide)(runtime)
    }
}

/// Shared list of descriptors.
pub type Descriptors = Arc<[Arc<InjectionDescriptor>]>;

/// Registered providers and their cached descriptors.
#[derive(Default)]
pub struct ProviderCatalog {
    providers: RwLock<Vec<Arc<dyn InjectionProvider>>>,
    cache: DashMap<String, Descriptors>,
}

impl ProviderCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        ProviderCatalog::default()
    }

    /// Register a provider. Cached descriptors of its assembly are discarded.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the provider list is poisoned.
    pub fn register(&self, provider: Arc<dyn InjectionProvider>) -> Result<()> {
        self.cache.remove(provider.assembly());
        write_lock!(self.providers).push(provider);
        Ok(())
    }

    /// Names of the assemblies declaring at least one provider, in registration order.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] if the provider list is poisoned.
    pub fn assemblies(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = Vec::new();
        for provider in read_lock!(self.providers).iter() {
            if !names.iter().any(|n| n == provider.assembly()) {
                names.push(provider.assembly().to_string());
            }
        }
        Ok(names)
    }

    /// Descriptors declared by `assembly`.
    ///
    /// # Errors
    /// Returns the first provider error; nothing is cached in that case.
    pub fn descriptors_from(&self, runtime: &Runtime, assembly: &str) -> Result<Descriptors> {
        if let Some(hit) = self.cache.get(assembly) {
            return Ok(Arc::clone(&hit));
        }

        let providers: Vec<_> = read_lock!(self.providers)
            .iter()
            .filter(|p| p.assembly() == assembly)
            .cloned()
            .collect();
        let mut descriptors = Vec::new();
        for provider in providers {
            descriptors.extend(provider.provide(runtime)?.into_iter().map(Arc::new));
        }
        log::debug!("{} descriptor(s) declared by {assembly}", descriptors.len());

        let descriptors: Descriptors = descriptors.into();
        self.cache.insert(assembly.to_string(), Arc::clone(&descriptors));
        Ok(descriptors)
    }

    /// Every descriptor of every registered provider.
    ///
    /// # Errors
    /// Returns the first provider error.
    pub fn all(&self, runtime: &Runtime) -> Result<Vec<Arc<InjectionDescriptor>>> {
        let mut all = Vec::new();
        for assembly in self.assemblies()? {
            all.extend(self.descriptors_from(runtime, &assembly)?.iter().cloned());
        }
        Ok(all)
    }

    /// Descriptors whose target lives in `assembly`.
    ///
    /// # Errors
    /// Returns the first provider error.
    pub fn descriptors_towards(&self, runtime: &Runtime, assembly: &str) -> Result<Vec<Arc<InjectionDescriptor>>> {
        Ok(self
            .all(runtime)?
            .into_iter()
            .filter(|d| d.target().assembly_name == assembly)
            .collect())
    }

    /// The weaving records of every descriptor, without duplicates.
    ///
    /// # Errors
    /// Returns the first provider error.
    pub fn records(&self, runtime: &Runtime) -> Result<Vec<WeavingRecord>> {
        Ok(crate::injection::record::dedupe(
            self.all(runtime)?.iter().map(|d| d.target().clone()),
        ))
    }
}

impl std::fmt::Debug for ProviderCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCatalog")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
