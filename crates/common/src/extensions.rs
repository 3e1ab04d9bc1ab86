//! Type-keyed property bag carried by every pipeline context.
//!
//! A bag created with [`ContextBag::child`] reads through to a frozen
//! snapshot of its parent and never writes to it. Values set on the child
//! shadow parent values of the same type.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

use crate::error::{Error, Result};

/// What [`ContextBag::set`] does when the type is already present locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BagStrictness {
    /// Replace the existing value.
    #[default]
    Overwrite,
    /// Fail with [`Error::ExtensionAlreadySet`].
    Strict,
}

#[derive(Clone)]
struct Entry {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Clone, Default)]
pub struct ContextBag {
    values: HashMap<TypeId, Entry>,
    parent: Option<Arc<ContextBag>>,
    strictness: BagStrictness,
}

impl ContextBag {
    pub fn new(strictness: BagStrictness) -> Self {
        Self {
            values: HashMap::new(),
            parent: None,
            strictness,
        }
    }

    /// Create a child scope over a snapshot of this bag.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            values: HashMap::new(),
            parent: Some(Arc::new(self.clone())),
            strictness: self.strictness,
        }
    }

    pub fn strictness(&self) -> BagStrictness {
        self.strictness
    }

    pub fn set<T: Any + Send + Sync>(&mut self, value: T) -> Result<()> {
        self.set_arc(Arc::new(value))
    }

    pub fn set_arc<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> Result<()> {
        let key = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        if self.strictness == BagStrictness::Strict && self.values.contains_key(&key) {
            return Err(Error::ExtensionAlreadySet { type_name });
        }
        self.values.insert(key, Entry { type_name, value });
        Ok(())
    }

    /// Look the type up locally, then in the parent chain.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self.values.get(&TypeId::of::<T>()) {
            Some(entry) => (*entry.value).downcast_ref::<T>(),
            None => self.parent.as_deref().and_then(|parent| parent.get::<T>()),
        }
    }

    pub fn get_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self.values.get(&TypeId::of::<T>()) {
            Some(entry) => Arc::clone(&entry.value).downcast::<T>().ok(),
            None => self
                .parent
                .as_deref()
                .and_then(|parent| parent.get_arc::<T>()),
        }
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.get::<T>().is_some()
    }

    /// Remove a value from the local scope. Parent values are untouched.
    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|entry| entry.value.downcast::<T>().ok())
    }
}

impl fmt::Debug for ContextBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.values.values().map(|e| e.type_name).collect();
        names.sort_unstable();
        f.debug_struct("ContextBag")
            .field("values", &names)
            .field("parent", &self.parent)
            .field("strictness", &self.strictness)
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tenant(&'static str);

    #[derive(Debug, PartialEq)]
    struct Attempt(u32);

    #[test]
    fn overwrite_replaces_existing_value() {
        let mut bag = ContextBag::new(BagStrictness::Overwrite);
        bag.set(Tenant("a")).unwrap();
        bag.set(Tenant("b")).unwrap();
        assert_eq!(bag.get::<Tenant>(), Some(&Tenant("b")));
    }

    #[test]
    fn strict_rejects_second_set_of_same_type() {
        let mut bag = ContextBag::new(BagStrictness::Strict);
        bag.set(Tenant("a")).unwrap();
        let err = bag.set(Tenant("b")).unwrap_err();
        assert!(matches!(err, Error::ExtensionAlreadySet { type_name } if type_name.ends_with("Tenant")));
        assert_eq!(bag.get::<Tenant>(), Some(&Tenant("a")));
    }

    #[test]
    fn child_reads_through_to_parent() {
        let mut parent = ContextBag::default();
        parent.set(Tenant("acme")).unwrap();

        let child = parent.child();
        assert_eq!(child.get::<Tenant>(), Some(&Tenant("acme")));
        assert!(child.get::<Attempt>().is_none());
    }

    #[test]
    fn child_writes_do_not_reach_parent() {
        let mut parent = ContextBag::new(BagStrictness::Strict);
        parent.set(Tenant("acme")).unwrap();

        let mut child = parent.child();
        // Strictness is per scope: shadowing a parent value is allowed.
        child.set(Tenant("shadow")).unwrap();
        child.set(Attempt(2)).unwrap();

        assert_eq!(child.get::<Tenant>(), Some(&Tenant("shadow")));
        assert_eq!(parent.get::<Tenant>(), Some(&Tenant("acme")));
        assert!(parent.get::<Attempt>().is_none());
    }

    #[test]
    fn remove_only_touches_local_scope() {
        let mut parent = ContextBag::default();
        parent.set(Tenant("acme")).unwrap();
        let mut child = parent.child();

        assert!(child.remove::<Tenant>().is_none());
        assert_eq!(child.get::<Tenant>(), Some(&Tenant("acme")));
    }

    #[test]
    fn get_arc_shares_the_stored_value() {
        let mut bag = ContextBag::default();
        let value = Arc::new(Attempt(7));
        bag.set_arc(Arc::clone(&value)).unwrap();
        let fetched = bag.child().get_arc::<Attempt>().unwrap();
        assert!(Arc::ptr_eq(&value, &fetched));
    }
}
