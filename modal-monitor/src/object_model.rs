//! Object representation consumed by the monitor subsystem.

pub mod header;
pub mod object;

pub use header::ObjectHeader;
pub use object::{create_hash_code, Object, ObjectRef};
