//! Data model shared by the `nixops4-aws` crates.
//!
//! A deployment is a set of [`Definition`]s: named, typed maps of attribute
//! [`Value`]s, which may contain [`Reference`]s to other resources. Each
//! resource type describes its attributes with a [`Schema`], which is checked
//! when a deployment is loaded, before any provider call.

pub mod definition;
pub mod error;
pub mod lifecycle;
pub mod reference;
pub mod schema;
pub mod value;

pub use definition::{Attrs, Definition};
pub use error::ConfigurationError;
pub use lifecycle::Lifecycle;
pub use reference::{Reference, ReferenceError};
pub use schema::{AttrKind, AttrSpec, Mutability, Schema};
pub use value::{Value, ValueError};
