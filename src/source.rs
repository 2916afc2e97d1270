//! Pipeline inputs.

pub mod script;
