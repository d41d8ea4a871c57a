//! Prompt Renderer - Render the issue prompt with Handlebars
//!
//! The default template ships inside the binary. A custom template file
//! replaces it wholesale and sees the same context.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;

use crate::domain::Issue;
use crate::error::{Result, ScryerError};
use crate::prompt::conventions::ConventionSection;

const ISSUE_TEMPLATE: &str = "issue";
const DEFAULT_TEMPLATE: &str = include_str!("issue.hbs");

/// Values visible to the template
#[derive(Debug, Serialize)]
pub struct PromptContext<'a> {
    pub number: u64,
    pub title: &'a str,
    pub url: &'a str,
    /// Trimmed body, empty when the issue has none
    pub body: &'a str,
    pub conventions: &'a [ConventionSection],
}

/// Renders the prompt handed to the generation tool
pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
}

impl std::fmt::Debug for PromptRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRenderer").finish_non_exhaustive()
    }
}

impl PromptRenderer {
    /// Renderer using the built-in template
    pub fn new() -> Result<Self> {
        Self::from_template(DEFAULT_TEMPLATE)
    }

    /// Renderer using a template file, falling back to the built-in one
    pub fn load(template_path: Option<&Path>) -> Result<Self> {
        match template_path {
            Some(path) => {
                let template = std::fs::read_to_string(path).map_err(|e| {
                    ScryerError::Template(format!("Failed to read template {}: {}", path.display(), e))
                })?;
                log::info!("using prompt template {}", path.display());
                Self::from_template(&template)
            }
            None => Self::new(),
        }
    }

    pub fn from_template(template: &str) -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        // Prompts are markdown, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string(ISSUE_TEMPLATE, template)
            .map_err(|e| ScryerError::Template(format!("Invalid template: {}", e)))?;
        Ok(Self { handlebars })
    }

    /// Render the prompt for `issue`.
    pub fn render(&self, issue: &Issue, conventions: &[ConventionSection]) -> Result<String> {
        let context = PromptContext {
            number: issue.number,
            title: issue.title.trim(),
            url: issue.url.as_deref().unwrap_or("").trim(),
            body: issue.body.as_deref().unwrap_or("").trim(),
            conventions,
        };
        let rendered = self
            .handlebars
            .render(ISSUE_TEMPLATE, &context)
            .map_err(|e| ScryerError::Template(format!("Failed to render template: {}", e)))?;
        Ok(format!("{}\n", rendered.trim()))
    }
}
