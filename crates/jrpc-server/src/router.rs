//! jsonrpc-hub Server Router: dispatches JSON-RPC requests to methods.

use std::any::{Any, type_name};

use jrpc_protocol::{HandlerResult, RpcError};
use jrpc_transport::RequestHandler;
use serde::Deserialize;
use serde_json::Value;

use crate::registry::{MethodRegistry, RegistryError};

/// The RPC server. Owns the method and class tables and routes requests.
#[derive(Default)]
pub struct RpcServer {
    registry: MethodRegistry,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a free function. Registering a name again replaces it.
    pub fn register_function<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: FnMut(&Value) -> HandlerResult + Send + 'static,
    {
        self.registry.insert_function(name, Box::new(function));
    }

    /// Register the object member functions of `class` operate on.
    pub fn register_class_object<T: Any + Send>(&mut self, class: impl Into<String>, object: T) {
        self.registry.insert_class(class, Box::new(object));
    }

    /// Register a member function under `Class.method`. It is called with the
    /// class object registered under `Class`, which must be a `T`.
    pub fn register_member_function<T, F>(
        &mut self,
        name: impl Into<String>,
        mut function: F,
    ) -> Result<(), RegistryError>
    where
        T: Any + Send,
        F: FnMut(&mut T, &Value) -> HandlerResult + Send + 'static,
    {
        let name = name.into();
        let method = name.clone();
        self.registry.insert_member(
            name,
            Box::new(move |object: &mut dyn Any, params: &Value| match object.downcast_mut::<T>() {
                Some(object) => function(object, params),
                None => Err(RpcError::internal(format!(
                    "class object for {method} is not a {}",
                    type_name::<T>()
                ))),
            }),
        )
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.registry.contains(method)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.registry.method_names()
    }

    pub fn class_object<T: Any>(&self, class: &str) -> Option<&T> {
        self.registry.class_object(class)
    }
}

impl RequestHandler for RpcServer {
    fn handle_request(&mut self, method: &str, params: &Value) -> HandlerResult {
        self.registry.call(method, params)
    }
}

/// Deserialize request params into `T`, mapping failures to invalid-params.
pub fn parse_params<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, RpcError> {
    T::deserialize(params).map_err(|e| RpcError::invalid_params(format!("Invalid parameters: {e}")))
}
