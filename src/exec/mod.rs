//! Query execution stages.
//!
//! A parsed [`Query`](crate::query::Query) flows through
//! [`matcher`] → [`filter`] → [`aggregate`] → [`assemble`], all reading one
//! immutable snapshot through a [`resolve::Resolver`].

pub mod aggregate;
pub mod assemble;
pub mod filter;
pub mod matcher;
pub mod resolve;
pub mod value;

pub use assemble::Row;
pub use resolve::{Bound, Env, Resolver};
pub use value::Value;
