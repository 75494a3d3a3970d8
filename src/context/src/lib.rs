//! Scoped registry of test collaborators and provisioned state.
//!
//! A [`TestContext`] owns a type-keyed instance store and an ordered list of
//! close callbacks. Contexts nest: a test-scoped context is a child of the
//! suite-scoped context and lookups fall back to the parent chain. The
//! lifecycle engine exclusively creates, seals and closes contexts; fulfillers
//! and test bodies only register into and resolve from them.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use thiserror::Error;

/// Marker for values produced by fulfillers and handed back to tests through
/// the context. States are opaque to the engine: they are stored for the
/// scope's duration and discarded when the scope ends.
pub trait State: Any + Send + Sync + fmt::Debug {
    /// Instance name distinguishing multiple states of the same type.
    fn name(&self) -> Option<&str> {
        None
    }
}

/// A type-erased state ready for registration, remembering the concrete type
/// it was built from.
pub struct StateHandle {
    type_id: TypeId,
    type_name: &'static str,
    name: Option<String>,
    value: Arc<dyn Any + Send + Sync>,
}

impl StateHandle {
    pub fn new<S: State>(state: S) -> Self {
        let name = state.name().map(str::to_owned);
        Self {
            type_id: TypeId::of::<S>(),
            type_name: type_name::<S>(),
            name,
            value: Arc::new(state),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Debug for StateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("type", &self.type_name)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("{key} is already registered in the {scope} context")]
    Duplicate { scope: &'static str, key: String },

    #[error("cannot register {key}: the {scope} context is sealed")]
    Sealed { scope: &'static str, key: String },

    #[error("{key} is not registered in this context or any parent")]
    NotFound { key: String },
}

/// One or more close callbacks failed. Every callback still ran; the failures
/// are reported together after the context closed.
#[derive(Debug)]
pub struct CloseError {
    failures: Vec<anyhow::Error>,
}

impl CloseError {
    pub fn failures(&self) -> &[anyhow::Error] {
        &self.failures
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} close callback(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{failure:#}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

type CloseCallback = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct Key {
    type_id: TypeId,
    name: Option<String>,
}

fn key_display(type_name: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("{type_name}({name})"),
        None => type_name.to_string(),
    }
}

/// Scoped instance store with parent fallback and ordered close callbacks.
pub struct TestContext {
    scope: &'static str,
    parent: Option<Arc<TestContext>>,
    entries: RwLock<HashMap<Key, Entry>>,
    callbacks: Mutex<Vec<CloseCallback>>,
    sealed: AtomicBool,
    closed: AtomicBool,
}

impl TestContext {
    /// Create a root context, typically the suite scope.
    pub fn root(scope: &'static str) -> Arc<Self> {
        Arc::new(Self::new(scope, None))
    }

    /// Create a child context whose lookups fall back to `self`.
    pub fn child(self: &Arc<Self>, scope: &'static str) -> Arc<Self> {
        Arc::new(Self::new(scope, Some(self.clone())))
    }

    fn new(scope: &'static str, parent: Option<Arc<TestContext>>) -> Self {
        Self {
            scope,
            parent,
            entries: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            sealed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn scope(&self) -> &'static str {
        self.scope
    }

    /// Register a singleton instance under its type. Fails on duplicate
    /// registration (a configuration conflict) and after the scope's setup
    /// phase completed.
    pub fn register<T: Any + Send + Sync>(&self, value: T) -> Result<(), ContextError> {
        self.register_keyed(
            Key { type_id: TypeId::of::<T>(), name: None },
            type_name::<T>(),
            Arc::new(value),
        )
    }

    /// Register a named instance, allowing several values of one type.
    pub fn register_named<T: Any + Send + Sync>(
        &self,
        name: impl Into<String>,
        value: T,
    ) -> Result<(), ContextError> {
        self.register_keyed(
            Key { type_id: TypeId::of::<T>(), name: Some(name.into()) },
            type_name::<T>(),
            Arc::new(value),
        )
    }

    /// Register a state produced by a fulfiller.
    pub fn register_state(&self, handle: StateHandle) -> Result<(), ContextError> {
        let StateHandle { type_id, type_name, name, value } = handle;
        self.register_keyed(Key { type_id, name }, type_name, value)
    }

    fn register_keyed(
        &self,
        key: Key,
        type_name: &'static str,
        value: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), ContextError> {
        let display = key_display(type_name, key.name.as_deref());
        if self.sealed.load(Ordering::Acquire) {
            return Err(ContextError::Sealed { scope: self.scope, key: display });
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&key) {
            return Err(ContextError::Duplicate { scope: self.scope, key: display });
        }
        log::debug!("registered {display} in {} context", self.scope);
        entries.insert(key, Entry { value });
        Ok(())
    }

    /// Resolve an instance by type, searching this scope then the parent
    /// chain.
    pub fn resolve<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ContextError> {
        self.resolve_keyed(&Key { type_id: TypeId::of::<T>(), name: None }, type_name::<T>())
    }

    pub fn resolve_named<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ContextError> {
        self.resolve_keyed(
            &Key { type_id: TypeId::of::<T>(), name: Some(name.to_string()) },
            type_name::<T>(),
        )
    }

    fn resolve_keyed<T: Any + Send + Sync>(
        &self,
        key: &Key,
        type_name: &'static str,
    ) -> Result<Arc<T>, ContextError> {
        let not_found = || ContextError::NotFound {
            key: key_display(type_name, key.name.as_deref()),
        };
        self.find(key)
            .ok_or_else(&not_found)?
            .downcast::<T>()
            .map_err(|_| not_found())
    }

    fn find(&self, key: &Key) -> Option<Arc<dyn Any + Send + Sync>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(key) {
            return Some(entry.value.clone());
        }
        drop(entries);
        self.parent.as_ref().and_then(|parent| parent.find(key))
    }

    /// Register a callback to run when this context closes. Callbacks run in
    /// reverse registration order, whatever the scope's outcome. Never fails;
    /// callbacks may be registered after the context is sealed.
    pub fn register_close_callback(
        &self,
        callback: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
    ) {
        if self.closed.load(Ordering::Acquire) {
            log::warn!("close callback registered on closed {} context, dropping it", self.scope);
            return;
        }
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Freeze the instance store. Registration past the setup phase is a
    /// programming error; close callbacks stay open.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the context: run every registered callback in reverse order. A
    /// failing callback never prevents the remaining ones from running; all
    /// failures are aggregated into the returned error. Closing twice is a
    /// no-op.
    pub fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let callbacks = std::mem::take(
            &mut *self.callbacks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        log::debug!("closing {} context, {} callback(s)", self.scope, callbacks.len());

        let mut failures = Vec::new();
        for callback in callbacks.into_iter().rev() {
            if let Err(err) = callback() {
                log::error!("close callback failed in {} context: {err:#}", self.scope);
                failures.push(err);
            }
        }

        if failures.is_empty() { Ok(()) } else { Err(CloseError { failures }) }
    }
}

impl fmt::Debug for TestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("TestContext")
            .field("scope", &self.scope)
            .field("entries", &entries.len())
            .field("sealed", &self.is_sealed())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Endpoint(String);

    #[test]
    fn test_register_and_resolve() {
        let context = TestContext::root("suite");
        context.register(Endpoint("localhost:8080".to_string())).unwrap();

        let endpoint = context.resolve::<Endpoint>().unwrap();
        assert_eq!(*endpoint, Endpoint("localhost:8080".to_string()));
    }

    #[test]
    fn test_lookup_falls_back_to_parent() {
        let suite = TestContext::root("suite");
        suite.register(Endpoint("suite".to_string())).unwrap();

        let test = suite.child("test");
        assert_eq!(test.resolve::<Endpoint>().unwrap().0, "suite");

        // A child registration shadows the parent without touching it.
        test.register_named("local", Endpoint("test".to_string())).unwrap();
        assert_eq!(test.resolve_named::<Endpoint>("local").unwrap().0, "test");
        assert!(suite.resolve_named::<Endpoint>("local").is_err());
    }

    #[test]
    fn test_duplicate_registration_fails_at_registration_time() {
        let context = TestContext::root("suite");
        context.register(Endpoint("a".to_string())).unwrap();

        let err = context.register(Endpoint("b".to_string())).unwrap_err();
        assert!(matches!(err, ContextError::Duplicate { scope: "suite", .. }));
        // The first registration is untouched.
        assert_eq!(context.resolve::<Endpoint>().unwrap().0, "a");
    }

    #[test]
    fn test_registration_after_seal_fails() {
        let context = TestContext::root("test");
        context.seal();

        let err = context.register(Endpoint("late".to_string())).unwrap_err();
        assert!(matches!(err, ContextError::Sealed { .. }));
    }

    #[test]
    fn test_resolve_missing() {
        let context = TestContext::root("test");
        let err = context.resolve::<Endpoint>().unwrap_err();
        assert!(matches!(err, ContextError::NotFound { .. }));
    }

    #[test]
    fn test_state_handles_register_under_concrete_type() {
        #[derive(Debug)]
        struct Provisioned {
            table: String,
        }
        impl State for Provisioned {}

        let context = TestContext::root("test");
        context
            .register_state(StateHandle::new(Provisioned { table: "nation".to_string() }))
            .unwrap();

        assert_eq!(context.resolve::<Provisioned>().unwrap().table, "nation");
    }

    #[test]
    fn test_callbacks_run_in_reverse_order() {
        let context = TestContext::root("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            context.register_close_callback(move || {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        context.close().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_callback_failure_does_not_stop_the_rest() {
        let context = TestContext::root("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let recorder = order.clone();
        context.register_close_callback(move || {
            recorder.lock().unwrap().push("first");
            Ok(())
        });
        context.register_close_callback(|| Err(anyhow::anyhow!("teardown exploded")));
        let recorder = order.clone();
        context.register_close_callback(move || {
            recorder.lock().unwrap().push("last");
            Ok(())
        });

        let err = context.close().unwrap_err();
        assert_eq!(err.failures().len(), 1);
        assert_eq!(*order.lock().unwrap(), vec!["last", "first"]);
    }

    #[test]
    fn test_close_runs_callbacks_once() {
        let context = TestContext::root("test");
        let count = Arc::new(Mutex::new(0));

        let counter = count.clone();
        context.register_close_callback(move || {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        context.close().unwrap();
        context.close().unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
