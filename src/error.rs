//! Module containing the universal error type for this crate
use thiserror::Error;

/// Universal error type for `levelset` operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,
    #[error("variable is not present in this `Context`")]
    BadVar,

    #[error("`IndexMap` is empty")]
    EmptyMap,

    #[error("unknown variable id {0}")]
    UnknownVar(usize),
}
