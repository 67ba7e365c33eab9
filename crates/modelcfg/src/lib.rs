pub mod schema;
pub mod launch;
pub mod registry;
pub mod validate;

pub use schema::*;
pub use launch::*;
pub use registry::*;
pub use validate::*;
