//! Entry point registry.
//!
//! Entry points come from two places:
//! - compile time: `register_entry_point!` submits an
//!   [`EntryPointRegistration`] collected by `inventory`
//! - run time: [`EntryPointRegistry::register`]
//!
//! Run-time registrations shadow compile-time ones with the same reference.

use std::collections::HashMap;
use std::sync::Arc;

use berth_shared::errors::{BerthResult, EntryPointError};
use parking_lot::RwLock;

use super::{Application, EntryPointRef};

/// What a reference points at.
///
/// Anything that is not an [`Application`] is kept so resolution can report
/// "found, but not an application" instead of "not found".
#[derive(Clone)]
pub enum EntryTarget {
    Application(Arc<dyn Application>),
    Other { kind: &'static str },
}

impl EntryTarget {
    pub fn application(app: impl Application + 'static) -> Self {
        EntryTarget::Application(Arc::new(app))
    }
}

impl std::fmt::Debug for EntryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryTarget::Application(_) => f.write_str("Application"),
            EntryTarget::Other { kind } => write!(f, "Other({kind})"),
        }
    }
}

/// Factory of a compile-time entry point.
pub type EntryFactory = fn() -> EntryTarget;

/// Compile-time registration submitted via `inventory`.
pub struct EntryPointRegistration {
    pub module: &'static str,
    pub attribute: &'static str,
    pub factory: EntryFactory,
}

inventory::collect!(EntryPointRegistration);

/// Register an entry point at compile time.
///
/// ```ignore
/// berth::register_entry_point!("server", "app", || {
///     berth::app::EntryTarget::application(MyApp)
/// });
/// ```
#[macro_export]
macro_rules! register_entry_point {
    ($module:literal, $attribute:literal, $factory:expr) => {
        $crate::inventory::submit! {
            $crate::app::EntryPointRegistration {
                module: $module,
                attribute: $attribute,
                factory: $factory,
            }
        }
    };
}

/// Resolves `module:attribute` references to applications.
#[derive(Default)]
pub struct EntryPointRegistry {
    runtime: RwLock<HashMap<EntryPointRef, EntryTarget>>,
}

impl EntryPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) an entry point at run time.
    pub fn register(&self, reference: &str, target: EntryTarget) -> BerthResult<()> {
        let reference: EntryPointRef = reference.parse()?;
        tracing::debug!(reference = %reference, target = ?target, "Registered entry point");
        self.runtime.write().insert(reference, target);
        Ok(())
    }

    /// Resolve a reference to an application.
    ///
    /// Distinguishes a missing module, a missing attribute and a target that
    /// exists but is not an application.
    pub fn resolve(&self, reference: &str) -> BerthResult<Arc<dyn Application>> {
        let reference: EntryPointRef = reference.parse()?;

        match self.lookup(&reference)? {
            EntryTarget::Application(app) => {
                tracing::debug!(reference = %reference, "Resolved entry point");
                Ok(app)
            }
            EntryTarget::Other { kind } => Err(EntryPointError::InvalidShape {
                reference: reference.to_string(),
                found: kind.to_string(),
            }
            .into()),
        }
    }

    /// All known references, sorted.
    pub fn references(&self) -> Vec<String> {
        let mut refs: Vec<String> = self
            .runtime
            .read()
            .keys()
            .map(ToString::to_string)
            .chain(
                inventory::iter::<EntryPointRegistration>
                    .into_iter()
                    .map(|r| format!("{}:{}", r.module, r.attribute)),
            )
            .collect();
        refs.sort();
        refs.dedup();
        refs
    }

    fn lookup(&self, reference: &EntryPointRef) -> BerthResult<EntryTarget> {
        if let Some(target) = self.runtime.read().get(reference) {
            return Ok(target.clone());
        }

        let mut module_found = self
            .runtime
            .read()
            .keys()
            .any(|r| r.module == reference.module);

        for registration in inventory::iter::<EntryPointRegistration> {
            if registration.module != reference.module {
                continue;
            }
            module_found = true;
            if registration.attribute == reference.attribute {
                return Ok((registration.factory)());
            }
        }

        if module_found {
            Err(EntryPointError::AttributeNotFound {
                module: reference.module.clone(),
                attribute: reference.attribute.clone(),
            }
            .into())
        } else {
            Err(EntryPointError::ModuleNotFound {
                module: reference.module.clone(),
            }
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use berth_shared::errors::BerthError;
    use bytes::Bytes;
    use hyper::StatusCode;

    use super::*;
    use crate::app::{Response, Scope};

    struct Hello;

    #[async_trait]
    impl Application for Hello {
        async fn call(&self, _scope: Scope, _body: Bytes) -> Response {
            Response::text(StatusCode::OK, "hello")
        }
    }

    crate::register_entry_point!("registry_fixture", "app", || EntryTarget::application(Hello));
    crate::register_entry_point!("registry_fixture", "settings", || EntryTarget::Other {
        kind: "dict"
    });

    fn entry_point_error(err: BerthError) -> EntryPointError {
        match err {
            BerthError::EntryPoint(e) => e,
            other => panic!("expected entry point error, got {other:?}"),
        }
    }

    #[test]
    fn test_resolves_compile_time_entry() {
        let registry = EntryPointRegistry::new();
        assert!(registry.resolve("registry_fixture:app").is_ok());
        assert!(
            registry
                .references()
                .contains(&"registry_fixture:app".to_string())
        );
    }

    #[test]
    fn test_not_found_and_invalid_shape_are_distinct() {
        let registry = EntryPointRegistry::new();

        let err = entry_point_error(registry.resolve("nowhere:app").err().unwrap());
        assert!(matches!(err, EntryPointError::ModuleNotFound { .. }));

        let err = entry_point_error(registry.resolve("registry_fixture:missing").err().unwrap());
        assert!(matches!(err, EntryPointError::AttributeNotFound { .. }));

        let err = entry_point_error(registry.resolve("registry_fixture:settings").err().unwrap());
        match err {
            EntryPointError::InvalidShape { reference, found } => {
                assert_eq!(reference, "registry_fixture:settings");
                assert_eq!(found, "dict");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_runtime_registration_shadows() {
        let registry = EntryPointRegistry::new();
        registry
            .register("registry_fixture:app", EntryTarget::Other { kind: "module" })
            .unwrap();
        assert!(registry.resolve("registry_fixture:app").is_err());

        registry
            .register("local:app", EntryTarget::application(Hello))
            .unwrap();
        assert!(registry.resolve("local:app").is_ok());
        let err = entry_point_error(registry.resolve("local:other").err().unwrap());
        assert!(matches!(err, EntryPointError::AttributeNotFound { .. }));
    }
}
