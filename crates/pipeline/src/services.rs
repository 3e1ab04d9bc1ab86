//! Registry of service factories resolved per invocation.
//!
//! Behaviors that need user-provided implementations (mutators, handlers)
//! ask the [`ServiceProvider`] carried by their context for every registered
//! implementation of a trait. Factories run on each resolution, so a
//! factory that builds a fresh value yields one instance per invocation.

use std::{
    any::{Any, TypeId, type_name},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use tracing::debug;

type Factory = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<TypeId, Vec<Factory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `T`, typically a trait object type.
    pub fn add<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || -> Box<dyn Any + Send + Sync> {
            Box::new(factory())
        });
        self.factories
            .entry(TypeId::of::<T>())
            .or_default()
            .push(factory);
        debug!(service = type_name::<T>(), "service registered");
        self
    }

    /// Register a shared instance that every resolution hands out.
    pub fn add_instance<T>(&mut self, instance: Arc<T>) -> &mut Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.add::<T, _>(move || Arc::clone(&instance))
    }

    pub fn into_provider(self) -> ServiceProvider {
        ServiceProvider(Arc::new(self))
    }
}

/// Cheaply clonable, read-only view over a [`ServiceRegistry`].
#[derive(Clone, Default)]
pub struct ServiceProvider(Arc<ServiceRegistry>);

impl ServiceProvider {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every implementation registered for `T`, in registration order.
    pub fn resolve_all<T>(&self) -> Vec<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.0
            .factories
            .get(&TypeId::of::<T>())
            .map(|factories| {
                factories
                    .iter()
                    .filter_map(|factory| factory().downcast::<Arc<T>>().ok())
                    .map(|boxed| *boxed)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has<T>(&self) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.0
            .factories
            .get(&TypeId::of::<T>())
            .is_some_and(|factories| !factories.is_empty())
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("services", &self.0.factories.len())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;
    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    struct French;
    impl Greeter for French {
        fn greet(&self) -> String {
            "bonjour".into()
        }
    }

    #[test]
    fn resolves_all_implementations_in_order() {
        let mut registry = ServiceRegistry::new();
        registry
            .add::<dyn Greeter, _>(|| Arc::new(English))
            .add_instance::<dyn Greeter>(Arc::new(French));
        let provider = registry.into_provider();

        let greetings: Vec<String> = provider
            .resolve_all::<dyn Greeter>()
            .iter()
            .map(|g| g.greet())
            .collect();
        assert_eq!(greetings, ["hello", "bonjour"]);
        assert!(provider.has::<dyn Greeter>());
    }

    #[test]
    fn factories_run_on_every_resolution() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut registry = ServiceRegistry::new();
        registry.add::<dyn Greeter, _>(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(English)
        });
        let provider = registry.into_provider();

        provider.resolve_all::<dyn Greeter>();
        provider.resolve_all::<dyn Greeter>();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unknown_service_resolves_to_nothing() {
        let provider = ServiceProvider::empty();
        assert!(provider.resolve_all::<dyn Greeter>().is_empty());
        assert!(!provider.has::<dyn Greeter>());
    }
}
