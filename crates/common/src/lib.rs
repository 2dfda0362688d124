//! Error-context plumbing shared by the parley crates.
//!
//! Each crate defines its own `thiserror` error enum; this crate supplies
//! the glue that lets any of them attach message context to `Result` and
//! `Option` without pulling in a catch-all error type.

mod context;

pub use context::FromMessage;
