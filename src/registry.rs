//! Function types and their registry.

use std::{fmt, path::PathBuf, sync::Arc};

use crate::{configfs::GadgetFs, objects::Function, Error, Result};

/// Coarse function classification selecting the exported remote interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum FunctionGroup {
    /// Serial-port style functions.
    Serial,
    /// Network functions.
    Net,
    /// Phonet functions.
    Phonet,
    /// User-space FunctionFS functions.
    Ffs,
    /// Everything else.
    Other,
}

/// Environment handed to function types when managing instances.
#[derive(Debug, Clone)]
pub struct FunctionEnv {
    /// Kernel gadget store.
    pub gadget_fs: GadgetFs,
    /// Root under which per-instance FunctionFS mounts are created.
    pub ffs_mount_root: PathBuf,
}

/// A registerable kind of USB function.
///
/// Instance creation and removal are mandatory for every type; the
/// unregister hook is optional.
pub trait FunctionType: fmt::Debug + Send + Sync {
    /// Registered type name.
    fn name(&self) -> &str;

    /// Function group of instances of this type.
    fn group(&self) -> FunctionGroup;

    /// Create an instance within the given gadget.
    fn create_instance(&self, env: &FunctionEnv, gadget: &str, instance: &str) -> Result<Function>;

    /// Remove an instance and its kernel state.
    fn remove_instance(&self, env: &FunctionEnv, gadget: &str, function: &mut Function) -> Result<()>;

    /// Notifies the type that it leaves the registry.
    fn on_unregister(&self) {}

    /// Whether the type currently refuses to leave the registry.
    fn busy(&self) -> bool {
        false
    }
}

/// Ordered set of known function types, keyed by name.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    types: Vec<Arc<dyn FunctionType>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function type. The first writer of a name wins.
    pub fn register(&mut self, ty: Arc<dyn FunctionType>) -> Result<()> {
        if self.lookup(ty.name()).is_some() {
            return Err(Error::Exist(format!("function type {} already registered", ty.name())));
        }

        self.types.push(ty);
        Ok(())
    }

    /// Function type by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn FunctionType>> {
        self.types.iter().find(|ty| ty.name() == name).cloned()
    }

    /// Unregister a function type by name.
    ///
    /// A type with outstanding instances refuses to leave the registry.
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let pos = self
            .types
            .iter()
            .position(|ty| ty.name() == name)
            .ok_or_else(|| Error::NotFound(format!("function type {name}")))?;

        if self.types[pos].busy() {
            return Err(Error::Exist(format!("function type {name} is still referenced")));
        }

        let ty = self.types.remove(pos);
        ty.on_unregister();
        Ok(())
    }

    /// Unregister every type at daemon shutdown.
    ///
    /// Types with outstanding instances are logged and kept.
    pub fn unregister_all(&mut self) {
        self.types.retain(|ty| {
            if ty.busy() {
                tracing::warn!("function type {} is still referenced, keeping it registered", ty.name());
                true
            } else {
                ty.on_unregister();
                false
            }
        });
    }

    /// Names of the registered types, in registration order.
    ///
    /// The returned iterator borrows the registry and is invalidated by any
    /// mutation.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|ty| ty.name())
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct StubType {
        name: String,
        busy: AtomicBool,
        unregistered: Arc<AtomicUsize>,
    }

    impl StubType {
        fn new(name: &str) -> (Arc<Self>, Arc<AtomicUsize>) {
            let unregistered = Arc::new(AtomicUsize::new(0));
            let ty = Arc::new(Self {
                name: name.to_string(),
                busy: AtomicBool::new(false),
                unregistered: unregistered.clone(),
            });
            (ty, unregistered)
        }
    }

    impl FunctionType for StubType {
        fn name(&self) -> &str {
            &self.name
        }

        fn group(&self) -> FunctionGroup {
            FunctionGroup::Other
        }

        fn create_instance(&self, _env: &FunctionEnv, _gadget: &str, _instance: &str) -> Result<Function> {
            unimplemented!()
        }

        fn remove_instance(&self, _env: &FunctionEnv, _gadget: &str, _function: &mut Function) -> Result<()> {
            unimplemented!()
        }

        fn on_unregister(&self) {
            self.unregistered.fetch_add(1, Ordering::Relaxed);
        }

        fn busy(&self) -> bool {
            self.busy.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn duplicate_registration() {
        let mut registry = FunctionRegistry::new();
        let (ty, _) = StubType::new("acm");
        registry.register(ty.clone()).unwrap();
        assert!(matches!(registry.register(ty), Err(Error::Exist(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_then_register() {
        let mut registry = FunctionRegistry::new();
        let (ty, unregistered) = StubType::new("acm");
        registry.register(ty.clone()).unwrap();
        registry.unregister("acm").unwrap();
        assert_eq!(unregistered.load(Ordering::Relaxed), 1);
        registry.register(ty).unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_missing() {
        let mut registry = FunctionRegistry::new();
        assert!(matches!(registry.unregister("acm"), Err(Error::NotFound(_))));
    }

    #[test]
    fn busy_type_is_kept() {
        let mut registry = FunctionRegistry::new();
        let (ty, unregistered) = StubType::new("echo");
        ty.busy.store(true, Ordering::Relaxed);
        registry.register(ty.clone()).unwrap();

        assert!(matches!(registry.unregister("echo"), Err(Error::Exist(_))));
        registry.unregister_all();
        assert_eq!(registry.len(), 1);
        assert_eq!(unregistered.load(Ordering::Relaxed), 0);

        ty.busy.store(false, Ordering::Relaxed);
        registry.unregister_all();
        assert!(registry.is_empty());
        assert_eq!(unregistered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn names_in_registration_order() {
        let mut registry = FunctionRegistry::new();
        for name in ["acm", "ecm", "obex"] {
            let (ty, _) = StubType::new(name);
            registry.register(ty).unwrap();
        }
        let names: Vec<_> = registry.type_names().collect();
        assert_eq!(names, ["acm", "ecm", "obex"]);
    }
}
