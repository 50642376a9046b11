//! Security module for ClawLoop: workspace confinement and sender allowlists.
//!
//! Provides:
//! - **Path confinement**: resolve paths against a workspace root after
//!   following symlinks, and detect lexical escapes in command arguments
//! - **Allowlists**: sender validation per channel

pub mod allowlist;
pub mod path;

pub use allowlist::{AllowlistPolicy, SenderCheckResult};
pub use path::{PathValidationError, contains_traversal, escapes_lexically, resolve_within};
