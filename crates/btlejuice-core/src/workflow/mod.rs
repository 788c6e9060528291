//! High-level workflows built on the core modules

pub mod intercept;

pub use intercept::{InterceptEvent, InterceptOptions, InterceptSession, OperatorCommand};
