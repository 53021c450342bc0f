//! Deciding how to hand control to downloaded code, and doing it.
//!
//! The launcher owns the interplay between the history store and the
//! resolver (a fresh-enough cache hit skips the network entirely), picks a
//! load strategy once per launch, and executes it inside an isolated
//! wasmtime context that exposes nothing of the host beyond WASI and the
//! pinned `comet:api` surface.

pub mod env;
pub mod error;
pub mod launcher;
pub mod loader;
pub mod strategy;

pub use env::HostEnv;
pub use error::StartError;
pub use launcher::{run_from_env, AppLauncher, LaunchEvents};
pub use loader::{Gateway, ModuleLoader};
pub use strategy::{select_load_strategy, Capabilities, ExecutionContext, LoadStrategy};
