//! MethodRegistry: method name to handler, class name to class object.
//!
//! A free function is called with the request params. A member function is
//! registered under a dotted `Class.method` name and called with the class
//! object registered under `Class`; both entries must exist.

use std::any::Any;

use jrpc_collections::HashTable;
use jrpc_protocol::{HandlerResult, RpcError};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub type FunctionHandler = Box<dyn FnMut(&Value) -> HandlerResult + Send>;
pub type MemberHandler = Box<dyn FnMut(&mut dyn Any, &Value) -> HandlerResult + Send>;

pub enum Handler {
    Function(FunctionHandler),
    Member { class: String, handler: MemberHandler },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("member function name '{0}' must have the form Class.method")]
    InvalidMemberName(String),
}

#[derive(Default)]
pub struct MethodRegistry {
    methods: HashTable<Handler>,
    classes: HashTable<Box<dyn Any + Send>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_function(&mut self, name: impl Into<String>, handler: FunctionHandler) {
        let name = name.into();
        if self.methods.insert(name.clone(), Handler::Function(handler)).is_some() {
            debug!("Replaced method: {name}");
        } else {
            debug!("Registered method: {name}");
        }
    }

    /// Register a member under `Class.method`; the class part is everything
    /// before the first dot.
    pub fn insert_member(
        &mut self,
        name: impl Into<String>,
        handler: MemberHandler,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        let class = match name.split_once('.') {
            Some((class, method)) if !class.is_empty() && !method.is_empty() => class.to_string(),
            _ => return Err(RegistryError::InvalidMemberName(name)),
        };
        if self
            .methods
            .insert(name.clone(), Handler::Member { class, handler })
            .is_some()
        {
            debug!("Replaced member function: {name}");
        } else {
            debug!("Registered member function: {name}");
        }
        Ok(())
    }

    pub fn insert_class(&mut self, class: impl Into<String>, object: Box<dyn Any + Send>) {
        let class = class.into();
        if self.classes.insert(class.clone(), object).is_some() {
            debug!("Replaced class object: {class}");
        } else {
            debug!("Registered class object: {class}");
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().filter_map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn class_object<T: Any>(&self, class: &str) -> Option<&T> {
        self.classes.get(class).and_then(|object| object.downcast_ref::<T>())
    }

    /// Resolve and invoke `method`. Unknown names, and members whose class
    /// object is missing, are "method not found".
    pub fn call(&mut self, method: &str, params: &Value) -> HandlerResult {
        let Some(handler) = self.methods.get_mut(method) else {
            return Err(RpcError::method_not_found(method));
        };
        match handler {
            Handler::Function(function) => function(params),
            Handler::Member { class, handler } => {
                let Some(object) = self.classes.get_mut(class.as_str()) else {
                    debug!("No class object registered for {method}");
                    return Err(RpcError::method_not_found(method));
                };
                handler(object.as_mut(), params)
            }
        }
    }
}
