//! # Edge Functions Control Plane
//!
//! Supervises an external edge-runtime process and everything around it:
//! binary acquisition, encrypted secrets, per-function metadata, function
//! scaffolding and the invocation proxy.
//!
//! ```text
//! Service ──> Store (SQLite, AES-GCM secrets)
//!    │
//!    └──> RuntimeManager ──> Downloader
//!               │
//!               └──> ProcessController ──> edge-runtime :port <── FunctionsProxy
//! ```

pub mod downloader;
pub mod errors;
pub mod function;
pub mod process;
pub mod proxy;
pub mod runtime;
pub mod service;
pub mod store;
pub mod templates;

pub use downloader::{Downloader, Platform};
pub use errors::{FunctionError, FunctionResult};
pub use function::{FunctionInfo, FunctionMetadata, FunctionStatus};
pub use process::{
    FakeBehavior, LaunchSpec, ProcessController, ProcessHandle, RecordingController,
    TokioProcessController,
};
pub use proxy::FunctionsProxy;
pub use runtime::{RuntimeConfig, RuntimeManager, RuntimeState, RuntimeStatus};
pub use service::{FunctionFile, Service};
pub use store::{SecretRecord, Store};
pub use templates::Template;
