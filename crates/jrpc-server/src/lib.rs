//! jsonrpc-hub Server: routes JSON-RPC requests to registered methods.
//!
//! The router owns the method and class-object tables and provides the
//! `RequestHandler` implementation for the transport layer.

pub mod registry;
pub mod router;

pub use registry::{Handler, MethodRegistry, RegistryError};
pub use router::{RpcServer, parse_params};
