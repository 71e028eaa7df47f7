use std::collections::BTreeMap;

use anyhow::{Context, Result};
use inquire::Text;
use tracing::{instrument, warn};

use crate::config::SyncSettings;
use crate::error::SyncError;

/// Source of file extensions for articles that arrive without one.
pub trait ExtensionResolver {
    /// Extension (without the leading period) for the article stored as `stem`.
    fn resolve(&mut self, stem: &str, title: &str) -> Result<String>;
}

/// Asks on the terminal, re-prompting until a usable extension is entered.
#[derive(Debug, Clone, Default)]
pub struct PromptExtensionResolver {
    suggestion: Option<String>,
}

impl PromptExtensionResolver {
    pub fn new(suggestion: Option<String>) -> Self {
        Self { suggestion }
    }
}

impl ExtensionResolver for PromptExtensionResolver {
    #[instrument(skip(self, title), level = "debug")]
    fn resolve(&mut self, stem: &str, title: &str) -> Result<String> {
        let message = format!("Extension for \"{title}\" (no period):");
        retry_until_valid(|| {
            let mut prompt = Text::new(&message)
                .with_help_message("the article will be written as <title>.<extension>");
            if let Some(suggestion) = self.suggestion.as_deref() {
                prompt = prompt.with_default(suggestion);
            }
            prompt
                .prompt()
                .with_context(|| format!("extension prompt for {stem} was aborted"))
        })
    }
}

/// Non-interactive lookup: per-stem table first, then the default.
#[derive(Debug, Clone, Default)]
pub struct TableExtensionResolver {
    by_stem: BTreeMap<String, String>,
    default: Option<String>,
}

impl TableExtensionResolver {
    pub fn new(by_stem: BTreeMap<String, String>, default: Option<String>) -> Self {
        Self { by_stem, default }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.extensions.clone(), settings.default_extension.clone())
    }
}

impl ExtensionResolver for TableExtensionResolver {
    fn resolve(&mut self, stem: &str, _title: &str) -> Result<String> {
        let raw = self
            .by_stem
            .get(stem)
            .or(self.default.as_ref())
            .ok_or_else(|| {
                SyncError::InputValidation(format!("no extension configured for {stem}"))
            })?;
        Ok(normalize_extension(raw)?)
    }
}

/// Build the resolver the settings ask for.
pub fn resolver_for(settings: &SyncSettings) -> Box<dyn ExtensionResolver> {
    if settings.prompt_for_extension {
        Box::new(PromptExtensionResolver::new(settings.default_extension.clone()))
    } else {
        Box::new(TableExtensionResolver::from_settings(settings))
    }
}

/// Trim whitespace and a leading period. Empty input and path separators are
/// rejected.
pub fn normalize_extension(raw: &str) -> Result<String, SyncError> {
    let extension = raw.trim().trim_start_matches('.');
    if extension.is_empty() {
        return Err(SyncError::InputValidation(
            "extension must not be empty".to_string(),
        ));
    }
    if extension.contains(['/', '\\']) {
        return Err(SyncError::InputValidation(format!(
            "extension {extension:?} must not contain path separators"
        )));
    }
    Ok(extension.to_string())
}

/// Keep asking while the answer fails validation; any other failure ends the loop.
fn retry_until_valid<F>(mut ask: F) -> Result<String>
where
    F: FnMut() -> Result<String>,
{
    loop {
        let answer = ask()?;
        match normalize_extension(&answer) {
            Ok(extension) => return Ok(extension),
            Err(error) if error.is_retryable() => warn!("{error}, please try again"),
            Err(error) => return Err(error.into()),
        }
    }
}
