//! Operation lifecycle management.

mod registry;

pub use registry::{OperationRegistry, StartOperation};
