// src/proxy.rs

//! Invocation adapter: reflects an object into methods callable by name.
//!
//! Rust has no runtime method reflection, so exposure is by explicit
//! registration. The visibility rule matches the bus convention shared with
//! Go and Qt peers: names starting with an uppercase letter are callable
//! through the bus, anything else is recorded as private-but-known so that
//! invocation can tell "missing" apart from "forbidden".
//!
//! Bindings are plain closures over whatever state the object needs; they
//! receive the decoded arguments and return the result sequence. A binding
//! that fails returns [`MethodFailure`]; a binding that panics is trapped by
//! the dispatch layer, not here.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use rmpv::Value;

use crate::error::{Error, Result};

type Binding = Arc<dyn Fn(Vec<Value>) -> std::result::Result<Vec<Value>, MethodFailure> + Send + Sync>;

/// Failure raised by a bound method during invocation.
///
/// Surfaces to a remote caller as a `ResultMethodError` frame and to a local
/// caller as [`Error::MethodError`].
pub struct MethodFailure(String);

impl MethodFailure {
    pub fn new(message: impl Into<String>) -> Self {
        MethodFailure(message.into())
    }

    pub(crate) fn into_message(self) -> String {
        self.0
    }
}

impl fmt::Debug for MethodFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodFailure").field(&self.0).finish()
    }
}

/// Adapter wrapping a local object so it can be invoked by method name with
/// dynamically-typed arguments.
#[derive(Clone, Default)]
pub struct Proxy {
    methods: HashMap<String, Binding>,
    private: HashSet<String>,
}

fn has_upper_prefix(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

impl Proxy {
    pub fn new() -> Self {
        Proxy::default()
    }

    /// Register a method under `name`.
    ///
    /// An uppercase-initial name becomes callable through the bus. Any other
    /// name is recorded as private: it exists, but calling it yields the
    /// "is private" flavor of [`Error::MethodNotFound`].
    pub fn register<F>(&mut self, name: impl Into<String>, binding: F)
    where
        F: Fn(Vec<Value>) -> std::result::Result<Vec<Value>, MethodFailure>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if has_upper_prefix(&name) {
            self.private.remove(&name);
            self.methods.insert(name, Arc::new(binding));
        } else {
            self.private.insert(name);
        }
    }

    /// Whether the proxy exposes nothing at all, callable or otherwise.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.private.is_empty()
    }

    /// Invoke `name` with the given arguments.
    pub fn call(&self, name: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        match self.methods.get(name) {
            Some(binding) => binding(params).map_err(|failure| {
                Error::MethodError(format!("'{}': {}", name, failure.into_message()))
            }),
            None => Err(Error::MethodNotFound {
                name: name.to_owned(),
                private: self.private.contains(name),
            }),
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("methods", &self.methods.len())
            .field("private", &self.private.len())
            .finish()
    }
}
