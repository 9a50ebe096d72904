//! Collections for the jsonrpc-hub core.
//!
//! Two containers live here:
//! - [`Buffer`]: the byte buffer every connection uses to accumulate partial
//!   reads and pending writes
//! - [`HashTable`]: a chained hash table keyed by a tagged union, backing the
//!   method, class-object, connection and notify-subscriber registries

pub mod buffer;
pub mod hashmap;
pub mod key;

pub use buffer::{BLOCK_SIZE, Buffer, BufferError};
pub use hashmap::{Cursor, HashTable, Iter};
pub use key::{HashKey, KeyRef};
