pub mod codelets;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod error;
pub mod resourcing;
pub mod runtime;
pub mod timer;

pub use error::{EngineError, EngineResult};
pub use runtime::engine::{Engine, EngineBuilder};
