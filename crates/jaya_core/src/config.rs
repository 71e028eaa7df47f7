use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::fixture::{DEFAULT_MODEL, DEFAULT_SITE_ID, FixtureTemplate};
use crate::reconcile::MatchMode;
use crate::runtime::ResolvedPaths;

pub const DEFAULT_EXTENSION: &str = "md";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct JayaConfig {
    #[serde(default)]
    pub blog: BlogSection,
    #[serde(default)]
    pub paths: PathsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct BlogSection {
    pub model: Option<String>,
    pub site_id: Option<i64>,
    pub prompt_for_extension: Option<bool>,
    pub default_extension: Option<String>,
    pub match_mode: Option<MatchMode>,
    #[serde(default)]
    pub extra_fields: toml::Table,
    #[serde(default)]
    pub extensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PathsSection {
    pub article_root: Option<PathBuf>,
    pub fixture_dir: Option<PathBuf>,
    pub fixture_file: Option<PathBuf>,
}

/// Load and parse a JayaConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<JayaConfig> {
    if !config_path.exists() {
        return Ok(JayaConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: JayaConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Everything a sync run needs, fixed once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub article_root: PathBuf,
    pub fixture_dir: PathBuf,
    pub fixture_file: PathBuf,
    pub template: FixtureTemplate,
    pub prompt_for_extension: bool,
    pub default_extension: Option<String>,
    pub extensions: BTreeMap<String, String>,
    pub match_mode: MatchMode,
}

impl SyncSettings {
    /// Resolve settings: env (`JAYA_MODEL`, `JAYA_SITE_ID`) > config > defaults.
    pub fn resolve(paths: &ResolvedPaths, config: &JayaConfig) -> Result<Self> {
        Self::resolve_with_lookup(paths, config, |key| env::var(key).ok())
    }

    fn resolve_with_lookup<F>(
        paths: &ResolvedPaths,
        config: &JayaConfig,
        lookup_env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let blog = &config.blog;

        let model = non_empty(lookup_env("JAYA_MODEL"))
            .or_else(|| blog.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let site_id = match non_empty(lookup_env("JAYA_SITE_ID")) {
            Some(value) => value
                .parse::<i64>()
                .with_context(|| format!("JAYA_SITE_ID must be an integer, got {value:?}"))?,
            None => blog.site_id.unwrap_or(DEFAULT_SITE_ID),
        };
        let extra_fields = toml_table_to_json(&blog.extra_fields)?;

        let default_extension = match blog.default_extension.as_deref() {
            None => Some(DEFAULT_EXTENSION.to_string()),
            Some(value) => {
                let value = value.trim().trim_start_matches('.');
                if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
        };

        Ok(Self {
            article_root: paths.article_root.clone(),
            fixture_dir: paths.fixture_dir.clone(),
            fixture_file: paths.fixture_file.clone(),
            template: FixtureTemplate {
                model,
                site_id,
                extra_fields,
            },
            prompt_for_extension: blog.prompt_for_extension.unwrap_or(true),
            default_extension,
            extensions: blog.extensions.clone(),
            match_mode: blog.match_mode.unwrap_or_default(),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn toml_table_to_json(table: &toml::Table) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in table {
        let converted = serde_json::to_value(value)
            .with_context(|| format!("extra field `{key}` cannot be represented as JSON"))?;
        out.insert(key.clone(), converted);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, JayaConfig::default());
    }

    #[test]
    fn load_config_parses_blog_section() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[blog]
model = "news.Entry"
site_id = 3
prompt_for_extension = false
default_extension = "rst"
match_mode = "title"

[blog.extra_fields]
status = 2
tags = ["rust", "blog"]

[blog.extensions]
"Foo_Bar" = "txt"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.blog.model.as_deref(), Some("news.Entry"));
        assert_eq!(config.blog.site_id, Some(3));
        assert_eq!(config.blog.prompt_for_extension, Some(false));
        assert_eq!(config.blog.match_mode, Some(MatchMode::Title));
        assert_eq!(config.blog.extensions.get("Foo_Bar").map(String::as_str), Some("txt"));
        assert_eq!(config.blog.extra_fields.len(), 2);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[blog\nmodel = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let paths = ResolvedPaths::under_root("/srv/blog");
        let settings = SyncSettings::resolve_with_lookup(&paths, &JayaConfig::default(), |_| None)
            .expect("settings");
        assert_eq!(settings.template, FixtureTemplate::default());
        assert!(settings.prompt_for_extension);
        assert_eq!(settings.default_extension.as_deref(), Some("md"));
        assert_eq!(settings.match_mode, MatchMode::PrimaryKey);
        assert_eq!(settings.article_root, paths.article_root);
    }

    #[test]
    fn settings_prefer_env_over_config() {
        let paths = ResolvedPaths::under_root("/srv/blog");
        let config = JayaConfig {
            blog: BlogSection {
                model: Some("news.Entry".to_string()),
                site_id: Some(3),
                ..BlogSection::default()
            },
            ..JayaConfig::default()
        };
        let env = HashMap::from([
            ("JAYA_MODEL".to_string(), "blog.Post".to_string()),
            ("JAYA_SITE_ID".to_string(), " 9 ".to_string()),
        ]);
        let settings =
            SyncSettings::resolve_with_lookup(&paths, &config, |key| env.get(key).cloned())
                .expect("settings");
        assert_eq!(settings.template.model, "blog.Post");
        assert_eq!(settings.template.site_id, 9);
    }

    #[test]
    fn settings_reject_non_numeric_site_id() {
        let paths = ResolvedPaths::under_root("/srv/blog");
        let error = SyncSettings::resolve_with_lookup(&paths, &JayaConfig::default(), |key| {
            (key == "JAYA_SITE_ID").then(|| "one".to_string())
        })
        .expect_err("must fail");
        assert!(error.to_string().contains("JAYA_SITE_ID"));
    }

    #[test]
    fn settings_convert_extra_fields_and_blank_extension() {
        let paths = ResolvedPaths::under_root("/srv/blog");
        let config: JayaConfig = toml::from_str(
            "[blog]\ndefault_extension = \"\"\n[blog.extra_fields]\nstatus = 2\nfeatured = true\n",
        )
        .expect("parse");
        let settings =
            SyncSettings::resolve_with_lookup(&paths, &config, |_| None).expect("settings");
        assert_eq!(settings.default_extension, None);
        assert_eq!(settings.template.extra_fields.get("status"), Some(&json!(2)));
        assert_eq!(
            settings.template.extra_fields.get("featured"),
            Some(&json!(true))
        );
    }
}
