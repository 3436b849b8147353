//! C15 — Service container: a lazy named registry of singletons with cycle
//! detection, so `bin/server.rs` can wire components without hand-ordering
//! their construction.

use crate::errors::{RagError, RagResult};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

type AnyArc = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn(&ServiceContainer) -> RagResult<AnyArc> + Send + Sync>;

enum Slot {
    Factory(Factory),
    Instance(AnyArc),
    Building,
}

/// Lazily constructs and caches named services. `get::<T>(name)` builds the
/// service (and, transitively, anything its factory asks the container for)
/// on first use, then returns the same instance on every later call.
///
/// Construction of a single name is serialized: two concurrent callers
/// racing `get` for the same not-yet-built name do not double-construct it
/// (the second blocks on the first's lock, then reads the cached result). A
/// factory that asks the container for the name it is itself building
/// (directly or through a chain of other factories) is a cycle and fails
/// with a named error rather than deadlocking or overflowing the stack.
pub struct ServiceContainer {
    slots: Mutex<HashMap<String, Slot>>,
    building: Mutex<Vec<String>>,
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            building: Mutex::new(Vec::new()),
        }
    }

    /// Registers a factory. Overwrites any existing registration for `name`.
    pub fn register<T, F>(&self, name: impl Into<String>, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceContainer) -> RagResult<T> + Send + Sync + 'static,
    {
        let boxed: Factory = Box::new(move |container| {
            factory(container).map(|v| Arc::new(v) as AnyArc)
        });
        self.slots.lock().insert(name.into(), Slot::Factory(boxed));
    }

    /// Registers an already-constructed instance directly, bypassing lazy
    /// construction entirely.
    pub fn register_instance<T: Any + Send + Sync>(&self, name: impl Into<String>, instance: Arc<T>) {
        self.slots
            .lock()
            .insert(name.into(), Slot::Instance(instance as AnyArc));
    }

    pub fn has(&self, name: &str) -> bool {
        self.slots.lock().contains_key(name)
    }

    pub fn list(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    /// Resolves `name` to a `T`, constructing it (and any transitive
    /// dependency) if this is the first request for it.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> RagResult<Arc<T>> {
        let any = self.resolve(name)?;
        any.downcast::<T>()
            .map_err(|_| RagError::configuration(format!("service '{name}' resolved to an unexpected type")))
    }

    fn resolve(&self, name: &str) -> RagResult<AnyArc> {
        {
            let slots = self.slots.lock();
            match slots.get(name) {
                None => {
                    return Err(RagError::configuration(format!("no service registered named '{name}'")));
                }
                Some(Slot::Instance(instance)) => return Ok(instance.clone()),
                Some(Slot::Building) => {
                    return Err(RagError::configuration(format!(
                        "cycle detected constructing service '{name}'"
                    )));
                }
                Some(Slot::Factory(_)) => {}
            }
        }

        {
            let mut stack = self.building.lock();
            if stack.iter().any(|n| n == name) {
                let mut path = stack.clone();
                path.push(name.to_string());
                return Err(RagError::configuration(format!(
                    "cycle detected constructing service '{name}': {}",
                    path.join(" -> ")
                )));
            }
            stack.push(name.to_string());
        }

        let factory = {
            let mut slots = self.slots.lock();
            match slots.insert(name.to_string(), Slot::Building) {
                Some(Slot::Factory(f)) => f,
                _ => {
                    self.building.lock().retain(|n| n != name);
                    return Err(RagError::configuration(format!(
                        "service '{name}' was concurrently modified during construction"
                    )));
                }
            }
        };

        let built = factory(self);
        self.building.lock().retain(|n| n != name);

        match built {
            Ok(instance) => {
                self.slots
                    .lock()
                    .insert(name.to_string(), Slot::Instance(instance.clone()));
                Ok(instance)
            }
            Err(e) => {
                self.slots.lock().remove(name);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_once_and_caches() {
        let container = ServiceContainer::new();
        let calls = Arc::new(Mutex::new(0u32));
        let calls_clone = calls.clone();
        container.register::<String, _>("greeting", move |_c| {
            *calls_clone.lock() += 1;
            Ok("hello".to_string())
        });

        let a = container.get::<String>("greeting").unwrap();
        let b = container.get::<String>("greeting").unwrap();
        assert_eq!(*a, "hello");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn unknown_name_errors() {
        let container = ServiceContainer::new();
        let result = container.get::<String>("missing");
        assert!(result.is_err());
    }

    #[test]
    fn transitive_dependency_resolves() {
        let container = ServiceContainer::new();
        container.register::<u32, _>("base", |_c| Ok(7u32));
        container.register::<u32, _>("doubled", |c| {
            let base = c.get::<u32>("base")?;
            Ok(*base * 2)
        });
        assert_eq!(*container.get::<u32>("doubled").unwrap(), 14);
    }

    #[test]
    fn self_referencing_factory_reports_a_cycle() {
        let container = ServiceContainer::new();
        container.register::<u32, _>("looped", |c| c.get::<u32>("looped").map(|v| *v));
        let result = container.get::<u32>("looped");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("looped"));
    }

    #[test]
    fn wrong_type_errors_instead_of_panicking() {
        let container = ServiceContainer::new();
        container.register::<u32, _>("num", |_c| Ok(1u32));
        let result = container.get::<String>("num");
        assert!(result.is_err());
    }
}
