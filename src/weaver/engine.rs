//! Weaving methods of one module image.
//!
//! [`weave_method`] is the default weave action. It turns
//!
//! ```text
//! public string Greet(string name) { <body> }
//! ```
//!
//! into
//!
//! ```text
//! private static Func<Player, string, string> DelegateField_Greet_000002;
//! private string OriginMethod_Greet_000002(string name) { <body> }
//!
//! [InjectedMethod(0x000002), DebuggerStepThrough]
//! public string Greet(string name)
//! {
//!     if (DelegateField_Greet_000002 == null) return OriginMethod_Greet_000002(name);
//!     return DelegateField_Greet_000002.Invoke(this, name);
//! }
//! ```
//!
//! [`weave_module`] drives the default or a custom action for every request that targets the
//! module, collecting per-request failures instead of aborting. [`inject_assembly`] adds the
//! read and write of the image around it.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    injection::{InjectionDescriptor, WeaveAction, WeavingRecord},
    metadata::{
        flags::FieldAttributes,
        model::{FieldDef, FieldHandle, MethodHandle, MethodId, ModuleDef, TypeHandle, CORLIB_NAME},
        token::StableId,
    },
    resolver::AssemblyResolver,
    signature::{find_method_by_signature, find_type_by_signature},
    weaver::{
        clone::clone_method,
        delegate::DelegateShape,
        marker,
        naming::GeneratedNames,
        stub::{self, ForwardingTargets},
    },
    Error, Result,
};

/// One method to weave, with the action that weaves it.
#[derive(Clone)]
pub struct WeaveRequest {
    /// The method to weave
    pub target: WeavingRecord,
    /// Custom action; [`weave_method`] when `None`
    pub action: Option<WeaveAction>,
}

impl WeaveRequest {
    /// A request using the default action.
    #[must_use]
    pub fn new(target: WeavingRecord) -> Self {
        WeaveRequest { target, action: None }
    }

    fn same_as(&self, other: &WeaveRequest) -> bool {
        self.target == other.target
            && match (&self.action, &other.action) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl From<&InjectionDescriptor> for WeaveRequest {
    fn from(descriptor: &InjectionDescriptor) -> Self {
        WeaveRequest {
            target: descriptor.target().clone(),
            action: descriptor.weave_action().cloned(),
        }
    }
}

impl From<WeavingRecord> for WeaveRequest {
    fn from(target: WeavingRecord) -> Self {
        WeaveRequest::new(target)
    }
}

impl fmt::Debug for WeaveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeaveRequest")
            .field("target", &self.target)
            .field("custom_action", &self.action.is_some())
            .finish()
    }
}

/// A request that could not be woven.
#[derive(Debug)]
pub struct WeaveFailure {
    /// The request's target
    pub target: WeavingRecord,
    /// Why it failed
    pub error: Error,
}

/// Result of weaving one module.
#[derive(Debug, Default)]
pub struct WeaveOutcome {
    /// The module changed and must be written
    pub dirty: bool,
    /// Targets changed by this pass
    pub woven: Vec<WeavingRecord>,
    /// Targets that were already woven
    pub unchanged: Vec<WeavingRecord>,
    /// Targets that failed
    pub failures: Vec<WeaveFailure>,
}

impl WeaveOutcome {
    /// `true` if no request failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drop repeated requests, keeping the first of each. Two requests are the same when they name
/// the same target and share the same action.
#[must_use]
pub fn distinct_requests(requests: &[WeaveRequest]) -> Vec<WeaveRequest> {
    let mut distinct: Vec<WeaveRequest> = Vec::with_capacity(requests.len());
    for request in requests {
        if !distinct.iter().any(|seen| seen.same_as(request)) {
            distinct.push(request.clone());
        }
    }
    distinct
}

fn stable_id_of(module: &mut ModuleDef, method: MethodId) -> Result<StableId> {
    if module.method(method)?.token.is_null() {
        module.assign_tokens();
    }
    Ok(module.method(method)?.token.stable())
}

fn check_weavable(module: &ModuleDef, method: MethodId, names: &GeneratedNames) -> Result<()> {
    let ty = module.type_def(method.ty)?;
    let def = module.method(method)?;
    let name = format!("{}::{}", module.type_full_name(TypeHandle::Def(method.ty)), def.name);

    if def.is_constructor() {
        return Err(synthesis_error!("{} is a constructor", name));
    }
    if def.body.is_none() {
        return Err(synthesis_error!("{} has no body", name));
    }
    if !def.generic_params.is_empty() || def.signature.generic_param_count > 0 {
        return Err(synthesis_error!("{} is a generic method", name));
    }
    if !ty.generic_params.is_empty() {
        return Err(synthesis_error!("{} is declared by a generic type", name));
    }
    let collides = ty.method_index(&names.origin_method).is_some()
        || ty.field_index(&names.delegate_field).is_some()
        || module.find_nested_type(method.ty, &names.delegate_type).is_some();
    if collides {
        return Err(synthesis_error!(
            "{} collides with existing members named after token {}",
            name,
            names.origin_method
        ));
    }
    Ok(())
}

/// Weave `method` of `module`, using the delegates of the base library module `corlib`.
///
/// Returns `false` without touching the module if the method already carries the marker.
///
/// # Examples
///
/// ```rust
/// use dotweave::{
///     corlib,
///     metadata::{
///         builder::{MethodBuilder, TypeBuilder},
///         model::ModuleDef,
///         signatures::TypeSig,
///     },
///     weaver::{is_woven, weave_method},
/// };
///
/// let mut module = ModuleDef::new("Game");
/// let object = module.corlib_type("System", "Object");
/// let player = TypeBuilder::new("Game", "Player").extends(object).build(&mut module);
/// let greet = MethodBuilder::new("Greet")
///     .param("name", TypeSig::String)
///     .returns(TypeSig::String)
///     .implementation(|asm| {
///         asm.ldarg_1()?.ret()?;
///         Ok(())
///     })
///     .build(&mut module, player)?;
/// module.assign_tokens();
///
/// let corlib = corlib::build()?;
/// assert!(weave_method(&mut module, greet, &corlib)?);
/// assert!(is_woven(&module, module.method(greet)?));
/// // Already marked: nothing changes
/// assert!(!weave_method(&mut module, greet, &corlib)?);
/// # Ok::<(), dotweave::Error>(())
/// ```
///
/// # Errors
/// Returns a synthesis error for constructors, methods without a body, generic methods,
/// methods of generic types, and methods whose generated names are taken. Errors of the
/// individual steps are propagated; the module may be partially modified in that case.
pub fn weave_method(module: &mut ModuleDef, method: MethodId, corlib: &ModuleDef) -> Result<bool> {
    if marker::is_woven(module, module.method(method)?) {
        return Ok(false);
    }
    let id = stable_id_of(module, method)?;
    let def = module.method(method)?;
    let names = GeneratedNames::new(&def.name, id);
    let virtual_origin = def.is_virtual();
    check_weavable(module, method, &names)?;

    let shape = DelegateShape::of_method(module, method)?;
    let origin = clone_method(module, method, &names.origin_method)?;
    let binding = shape.bind(module, corlib, method.ty, &names.delegate_type)?;
    let field = module.add_field(
        method.ty,
        FieldDef::new(
            &names.delegate_field,
            FieldAttributes::PRIVATE | FieldAttributes::STATIC,
            binding.field_type.clone(),
        ),
    )?;

    stub::rewrite(
        module,
        method,
        ForwardingTargets {
            field: FieldHandle::Def(field),
            origin: MethodHandle::Def(origin),
            invoke: binding.invoke,
            virtual_origin,
        },
    )?;
    stub::step_through(module, method)?;
    marker::mark(module, method, id)?;
    Ok(true)
}

/// Resolve every type and member reference of `module` added since `types_from` and
/// `members_from` against the assemblies `resolver` may load.
fn check_new_references(
    module: &ModuleDef,
    resolver: &AssemblyResolver,
    types_from: usize,
    members_from: usize,
) -> Result<()> {
    for index in types_from..module.type_refs.len() {
        resolver.locate_type(module, TypeHandle::Ref(index))?;
    }
    for index in members_from..module.member_refs.len() {
        resolver.locate_member(module, index)?;
    }
    Ok(())
}

fn weave_request(
    module: &mut ModuleDef,
    request: &WeaveRequest,
    resolver: &AssemblyResolver,
    corlib: &ModuleDef,
) -> Result<bool> {
    let target = &request.target;
    let ty = find_type_by_signature(module, &target.klass_signature)
        .ok_or_else(|| Error::TypeNotFound(target.klass_signature.clone()))?;
    let method = find_method_by_signature(module, ty, &target.method_signature).ok_or_else(|| {
        Error::MethodNotFound {
            klass: target.klass_signature.clone(),
            method: target.method_signature.clone(),
        }
    })?;

    match &request.action {
        None => {
            let (types_from, members_from) = (module.type_refs.len(), module.member_refs.len());
            let changed = weave_method(module, method, corlib)?;
            check_new_references(module, resolver, types_from, members_from)?;
            Ok(changed)
        }
        Some(action) => {
            let id = stable_id_of(module, method)?;
            let changed = action(module, method)?;
            let marked = marker::mark(module, method, id)?;
            Ok(changed || marked)
        }
    }
}

/// Weave every request of `requests` that targets `module`.
///
/// Requests naming another assembly are ignored. Per-request failures, including targets that
/// cannot be found, are collected in the outcome. The references the default action adds to
/// the module are resolved through `resolver`, so a weave that points at an assembly outside the
/// allow-list, or at a member its definition lacks, fails the request.
///
/// # Errors
/// Returns an error only if the base library cannot be resolved.
pub fn weave_module(
    module: &mut ModuleDef,
    requests: &[WeaveRequest],
    resolver: &AssemblyResolver,
) -> Result<WeaveOutcome> {
    let corlib = resolver.resolve(CORLIB_NAME)?;
    if module.method_ids().any(|id| module.method(id).is_ok_and(|m| m.token.is_null())) {
        module.assign_tokens();
    }

    let mut outcome = WeaveOutcome::default();
    for request in distinct_requests(requests) {
        if request.target.assembly_name != module.name {
            log::debug!("Skipping {}: not part of {}", request.target, module.name);
            continue;
        }
        match weave_request(module, &request, resolver, corlib.module()) {
            Ok(true) => {
                log::info!("Woven {}", request.target);
                outcome.dirty = true;
                outcome.woven.push(request.target);
            }
            Ok(false) => {
                log::debug!("Already woven: {}", request.target);
                outcome.unchanged.push(request.target);
            }
            Err(error) => {
                if error.is_resolution() {
                    log::warn!("Cannot resolve {}: {error}", request.target);
                } else {
                    log::error!("Cannot weave {}: {error}", request.target);
                }
                outcome.failures.push(WeaveFailure {
                    target: request.target,
                    error,
                });
            }
        }
    }
    Ok(outcome)
}

/// Weave the image at `path` and write it to `output` if anything changed.
///
/// `allowed` lists the assembly files references may be resolved from. Symbols are read and
/// written only if a symbol file exists beside `path`.
///
/// # Errors
/// Returns an error if the image cannot be read or written, or the base library cannot be
/// resolved. Per-request failures are reported in the outcome.
pub fn inject_assembly(
    path: &Path,
    requests: &[WeaveRequest],
    allowed: &[PathBuf],
    output: &Path,
) -> Result<WeaveOutcome> {
    let mut module = ModuleDef::from_path(path)?;
    let outcome = {
        let resolver = AssemblyResolver::new(allowed.to_vec());
        weave_module(&mut module, requests, &resolver)?
    };

    if outcome.dirty {
        module.write_to(output)?;
        log::info!(
            "Wrote {} with {} woven method(s) to {}",
            module.name,
            outcome.woven.len(),
            output.display()
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::OpCode,
        corlib,
        metadata::{
            builder::{MethodBuilder, TypeBuilder},
            flags::{MethodAttributes, ParamAttributes, TypeAttributes},
            signatures::TypeSig,
        },
        weaver::marker::stable_id,
    };

    fn game() -> (ModuleDef, usize, MethodId) {
        let mut module = ModuleDef::new("Game");
        let object = module.corlib_type("System", "Object");
        let player = TypeBuilder::new("Game", "Player").extends(object).build(&mut module);
        let greet = MethodBuilder::new("Greet")
            .param("name", TypeSig::String)
            .returns(TypeSig::String)
            .implementation(|asm| {
                asm.ldarg_1()?.ret()?;
                Ok(())
            })
            .build(&mut module, player)
            .unwrap();
        module.assign_tokens();
        (module, player, greet)
    }

    #[test]
    fn default_action_generates_members() {
        let (mut module, player, greet) = game();
        let corlib = corlib::build().unwrap();
        let token = module.method(greet).unwrap().token.stable();

        assert!(weave_method(&mut module, greet, &corlib).unwrap());

        let names = GeneratedNames::new("Greet", token);
        let ty = &module.types[player];
        let origin = ty.method_index(&names.origin_method).unwrap();
        let field = ty.field_index(&names.delegate_field).unwrap();
        assert!(ty.methods[origin].flags.has_access(MethodAttributes::PRIVATE));
        assert!(ty.fields[field].flags.contains(FieldAttributes::STATIC | FieldAttributes::PRIVATE));
        assert!(module.find_nested_type(player, &names.delegate_type).is_none());

        let def = module.method(greet).unwrap();
        assert_eq!(stable_id(&module, def), Some(token));
        assert!(module.has_attribute(&def.custom_attributes, "System.Diagnostics", "DebuggerStepThroughAttribute"));
        assert_eq!(def.body.as_ref().unwrap().instructions[0].opcode, OpCode::Ldsfld);
    }

    #[test]
    fn weaving_twice_changes_nothing() {
        let (mut module, player, greet) = game();
        let corlib = corlib::build().unwrap();
        assert!(weave_method(&mut module, greet, &corlib).unwrap());
        let methods = module.types[player].methods.len();
        assert!(!weave_method(&mut module, greet, &corlib).unwrap());
        assert_eq!(module.types[player].methods.len(), methods);
        assert_eq!(module.method(greet).unwrap().custom_attributes.len(), 2);
    }

    #[test]
    fn out_parameters_get_a_nested_delegate() {
        let (mut module, player, _) = game();
        let parse = MethodBuilder::new("TryParse")
            .static_method()
            .param("text", TypeSig::String)
            .param_with("value", TypeSig::I4.by_ref(), ParamAttributes::OUT)
            .returns(TypeSig::Boolean)
            .implementation(|asm| {
                asm.ldarg_1()?.ldc_i4(7)?.stind_i4()?.ldc_i4(1)?.ret()?;
                Ok(())
            })
            .build(&mut module, player)
            .unwrap();
        module.assign_tokens();
        let corlib = corlib::build().unwrap();
        let token = module.method(parse).unwrap().token.stable();
        weave_method(&mut module, parse, &corlib).unwrap();

        let names = GeneratedNames::new("TryParse", token);
        let delegate = module.find_nested_type(player, &names.delegate_type).unwrap();
        assert_eq!(module.types[delegate].flags, TypeAttributes::NESTED_PRIVATE | TypeAttributes::SEALED);
        let field = module.types[player].field_index(&names.delegate_field).unwrap();
        assert_eq!(
            module.types[player].fields[field].signature,
            TypeSig::Class(TypeHandle::Def(delegate))
        );
    }

    #[test]
    fn rejected_targets() {
        let (mut module, player, _) = game();
        let abstract_method = MethodBuilder::new("Tick")
            .flags(MethodAttributes::PUBLIC | MethodAttributes::VIRTUAL | MethodAttributes::ABSTRACT)
            .build(&mut module, player)
            .unwrap();
        let ctor = MethodBuilder::constructor()
            .implementation(|asm| {
                asm.ret()?;
                Ok(())
            })
            .build(&mut module, player)
            .unwrap();
        module.assign_tokens();
        let corlib = corlib::build().unwrap();
        for method in [abstract_method, ctor] {
            assert!(matches!(
                weave_method(&mut module, method, &corlib),
                Err(Error::Synthesis(_))
            ));
        }
    }

    #[test]
    fn name_collisions_are_rejected() {
        let (mut module, player, greet) = game();
        let token = module.method(greet).unwrap().token.stable();
        let names = GeneratedNames::new("Greet", token);
        MethodBuilder::new(&names.origin_method).build(&mut module, player).unwrap();
        let corlib = corlib::build().unwrap();
        assert!(matches!(
            weave_method(&mut module, greet, &corlib),
            Err(Error::Synthesis(_))
        ));
    }

    #[test]
    fn module_pass_collects_failures() {
        let (mut module, _, _) = game();
        let resolver = AssemblyResolver::new(Vec::new());
        let requests = vec![
            WeaveRequest::new(WeavingRecord::new("Game", "Game.Player", "Greet<System.String>")),
            WeaveRequest::new(WeavingRecord::new("Game", "Game.Player", "Greet<System.String>")),
            WeaveRequest::new(WeavingRecord::new("Game", "Game.Missing", "Greet<System.String>")),
            WeaveRequest::new(WeavingRecord::new("Game", "Game.Player", "Missing<>")),
            WeaveRequest::new(WeavingRecord::new("Engine", "Engine.Loop", "Run<>")),
        ];
        let outcome = weave_module(&mut module, &requests, &resolver).unwrap();
        assert!(outcome.dirty);
        assert_eq!(outcome.woven.len(), 1);
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures.iter().all(|f| f.error.is_resolution()));

        let again = weave_module(&mut module, &requests[..1], &resolver).unwrap();
        assert!(!again.dirty);
        assert_eq!(again.unchanged.len(), 1);
    }

    #[test]
    fn generated_references_resolve_through_the_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut corlib = corlib::build().unwrap();
        let step_through = corlib
            .find_type("System.Diagnostics", "DebuggerStepThroughAttribute")
            .unwrap();
        corlib.types[step_through].name = "StepThroughRemoved".to_string();
        let path = dir.path().join(format!("{CORLIB_NAME}.dll"));
        corlib.write_to(&path).unwrap();

        let request = WeaveRequest::new(WeavingRecord::new("Game", "Game.Player", "Greet<System.String>"));
        let (mut module, _, _) = game();
        let stripped = AssemblyResolver::new(vec![path]);
        let outcome = weave_module(&mut module, &[request.clone()], &stripped).unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert!(matches!(outcome.failures[0].error, Error::TypeNotFound(_)));
        assert_eq!(stripped.cached(), 1);

        let (mut module, _, _) = game();
        let builtin = AssemblyResolver::new(Vec::new());
        let outcome = weave_module(&mut module, &[request], &builtin).unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.woven.len(), 1);
    }

    #[test]
    fn custom_actions_are_marked_afterwards() {
        let (mut module, _, greet) = game();
        let resolver = AssemblyResolver::new(Vec::new());
        let action: WeaveAction = Arc::new(|_: &mut ModuleDef, _: MethodId| Ok(false));
        let request = WeaveRequest {
            target: WeavingRecord::new("Game", "Game.Player", "Greet<System.String>"),
            action: Some(action),
        };
        let outcome = weave_module(&mut module, &[request.clone(), request], &resolver).unwrap();
        assert!(outcome.dirty);
        assert_eq!(outcome.woven.len(), 1);
        let def = module.method(greet).unwrap();
        assert!(marker::is_woven(&module, def));
        assert_eq!(def.body.as_ref().unwrap().instructions.len(), 2);
    }
}
