//! Text stages applied to Converter output.
//!
//! Each submodule implements exactly one step, so each is independently
//! testable and none of them touch the file system.
//!
//! ## Data Flow
//!
//! ```text
//! raw text ──▶ normalize ──▶ classify ──▶ repair ──▶ clean text
//!              (prelude)     (spans)      (edits)
//! ```
//!
//! 1. [`normalize`]: line endings and invisible code points
//! 2. [`classify`]: locate artifact spans per [`classify::ArtifactCategory`];
//!    uses [`markup`] for Markdown structure, [`mojibake`] for the
//!    mis-decoding table and [`dictionary`] for known mixed-case terms
//! 3. [`repair`]: ordered, fail-soft, idempotent fix passes

pub mod classify;
pub mod dictionary;
pub mod markup;
pub mod mojibake;
pub mod normalize;
pub mod repair;
