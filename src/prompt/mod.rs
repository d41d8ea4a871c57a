//! Prompt System - Template rendering for the generation tool
//!
//! Renders the issue prompt with Handlebars and quotes the repository's
//! convention files into it.

mod conventions;
mod render;

pub use conventions::{ConventionSection, load_conventions};
pub use render::{PromptContext, PromptRenderer};
