#[macro_use]
extern crate tracing;

pub mod backend;
pub mod binary;
pub mod cmd;
pub mod config;
pub mod config_synth;
pub mod context;
pub mod errors;
pub mod executor;
pub mod fs;
pub mod injector;
pub mod logger;
pub mod metrics;
pub mod module_inspect;
pub mod provider;
pub mod runtime;
pub mod secret;

pub use context::RecipeInvocationContext;
pub use errors::RecipeEngineError;
pub use executor::{DeployResult, Executor, ModuleMetadata};
