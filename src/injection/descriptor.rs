//! Injection descriptors: what to replace and how.

use std::{fmt, sync::Arc};

use crate::{
    injection::record::WeavingRecord,
    metadata::model::{MethodId, ModuleDef},
    runtime::{delegate::DelegateValue, value::Value, Runtime, RuntimeMethodId},
    Result,
};

/// Turns the callable over the original body into the replacement callable.
pub type Transform = Arc<dyn Fn(Arc<DelegateValue>) -> Result<DelegateValue> + Send + Sync>;

/// A weave action run instead of the default one. Returns `true` if it modified the module.
pub type WeaveAction = Arc<dyn Fn(&mut ModuleDef, MethodId) -> Result<bool> + Send + Sync>;

/// An install action run instead of the default one.
pub type InstallAction =
    Arc<dyn Fn(&crate::driver::InjectionDriver, &InjectionDescriptor) -> Result<()> + Send + Sync>;

/// One method replacement.
///
/// The target is named structurally so the same descriptor drives both sides: the weaver finds
/// the method in the image on disk, the driver finds it in the loaded process.
#[derive(Clone)]
pub struct InjectionDescriptor {
    target: WeavingRecord,
    transform: Transform,
    weave_action: Option<WeaveAction>,
    install_action: Option<InstallAction>,
}

impl InjectionDescriptor {
    /// A descriptor replacing `target` with whatever `transform` builds from the original.
    pub fn new<F>(target: WeavingRecord, transform: F) -> Self
    where
        F: Fn(Arc<DelegateValue>) -> Result<DelegateValue> + Send + Sync + 'static,
    {
        InjectionDescriptor {
            target,
            transform: Arc::new(transform),
            weave_action: None,
            install_action: None,
        }
    }

    /// A descriptor whose replacement is the host function `f`.
    ///
    /// `f` receives the original callable and the arguments of the call, receiver first for
    /// instance methods.
    ///
    /// ```rust
    /// use dotweave::injection::{InjectionDescriptor, WeavingRecord};
    /// use dotweave::runtime::value::Value;
    ///
    /// let record = WeavingRecord::new("Game", "Game.Player", "Greet<System.String>");
    /// let descriptor = InjectionDescriptor::intercept(record, |runtime, original, args| {
    ///     let greeting = original.invoke(runtime, args)?;
    ///     Ok(Value::string(&format!("{} (hooked)", greeting.as_str().unwrap_or_default())))
    /// });
    /// assert_eq!(descriptor.target().assembly_name, "Game");
    /// ```
    pub fn intercept<F>(target: WeavingRecord, f: F) -> Self
    where
        F: Fn(&Runtime, &DelegateValue, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        InjectionDescriptor::new(target, move |original| {
            let f = Arc::clone(&f);
            Ok(DelegateValue::native(original.ty, move |runtime, args| {
                f(runtime, &original, args)
            }))
        })
    }

    /// A descriptor for a method already loaded into `runtime`.
    ///
    /// # Errors
    /// Returns an error if the method cannot be described.
    pub fn for_method<F>(runtime: &Runtime, method: RuntimeMethodId, transform: F) -> Result<Self>
    where
        F: Fn(Arc<DelegateValue>) -> Result<DelegateValue> + Send + Sync + 'static,
    {
        Ok(InjectionDescriptor::new(
            WeavingRecord::from_runtime(runtime, method)?,
            transform,
        ))
    }

    /// Run `action` instead of the default weave action.
    #[must_use]
    pub fn with_weave_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut ModuleDef, MethodId) -> Result<bool> + Send + Sync + 'static,
    {
        self.weave_action = Some(Arc::new(action));
        self
    }

    /// Run `action` instead of the default install action.
    #[must_use]
    pub fn with_install_action<F>(mut self, action: F) -> Self
    where
        F: Fn(&crate::driver::InjectionDriver, &InjectionDescriptor) -> Result<()> + Send + Sync + 'static,
    {
        self.install_action = Some(Arc::new(action));
        self
    }

    /// The method to replace.
    #[must_use]
    pub fn target(&self) -> &WeavingRecord {
        &self.target
    }

    /// The custom weave action, if any.
    #[must_use]
    pub fn weave_action(&self) -> Option<&WeaveAction> {
        self.weave_action.as_ref()
    }

    /// The custom install action, if any.
    #[must_use]
    pub fn install_action(&self) -> Option<&InstallAction> {
        self.install_action.as_ref()
    }

    /// Build the replacement for `original`.
    ///
    /// # Errors
    /// Propagates the transform's error.
    pub fn replacement(&self, original: Arc<DelegateValue>) -> Result<DelegateValue> {
        (self.transform)(original)
    }
}

impl fmt::Debug for InjectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionDescriptor")
            .field("target", &self.target)
            .field("weave_action", &self.weave_action.is_some())
            .field("install_action", &self.install_action.is_some())
            .finish()
    }
}
