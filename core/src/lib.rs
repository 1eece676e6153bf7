//! Core of the overpass proxy: the agent orchestrator and the subsystems
//! it drives. Provider adapters, the prompt cache, the policy engine, the
//! tool registry with its built-in tools, the sandboxed subprocess runner,
//! and the MCP registry all live here.

pub mod cache;
pub mod config;
pub mod error;
pub mod exec;
pub mod mcp;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod provider;
pub mod tools;
pub mod web_fallback;

pub use config::Config;
pub use error::OverpassErr;
pub use error::Result;
pub use orchestrator::Orchestrator;
pub use orchestrator::ProcessOutcome;
