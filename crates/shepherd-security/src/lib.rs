//! Security primitives for shepherd workers.
//!
//! Agents run with the worker's filesystem access, so the bridge daemon can
//! check what an agent actually wrote against a glob policy, and it escapes
//! untrusted text before placing it inside a prompt.
//!
//! # Main types
//!
//! - [`WritePolicy`]: Allow/deny globs applied to a working-tree diff.
//! - [`TreeSnapshot`]: Content hashes of a working tree, diffable.
//! - [`PromptSanitizer`]: Strips control characters and neutralises structural tags.

/// Glob-based write policy.
pub mod policy;
/// Prompt text sanitization.
pub mod sanitizer;
/// Working-tree snapshots and diffs.
pub mod snapshot;

pub use policy::{PolicyVerdict, WritePolicy};
pub use sanitizer::{escape_structural_tags, truncate_chars, PromptSanitizer};
pub use snapshot::{TreeDiff, TreeSnapshot};
