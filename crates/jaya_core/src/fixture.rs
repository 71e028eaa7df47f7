use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};

use crate::error::SyncError;

pub const DEFAULT_MODEL: &str = "blog.BlogPost";
pub const DEFAULT_SITE_ID: i64 = 1;

const FIXTURE_INDENT: &[u8] = b"    ";

/// One database record as it appears in a fixture array.
///
/// A `pk` of `None` is written as `null` and means the remote store has not
/// assigned a primary key yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub pk: Option<i64>,
    pub model: String,
    pub fields: Map<String, Value>,
}

impl FixtureRecord {
    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(Value::as_str)
    }

    pub fn content(&self) -> Option<&str> {
        self.fields.get("content").and_then(Value::as_str)
    }

    pub fn site_id(&self) -> Option<i64> {
        self.fields.get("site_id").and_then(Value::as_i64)
    }
}

/// Shape shared by every record this tool writes.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureTemplate {
    pub model: String,
    pub site_id: i64,
    pub extra_fields: Map<String, Value>,
}

impl Default for FixtureTemplate {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            site_id: DEFAULT_SITE_ID,
            extra_fields: Map::new(),
        }
    }
}

impl FixtureTemplate {
    /// Build a record with `site_id`, `title` and `content` first, followed by
    /// the extra fields. Extra fields win over the base ones on name clashes.
    pub fn construct(&self, pk: Option<i64>, title: &str, content: &str) -> FixtureRecord {
        let mut fields = Map::new();
        fields.insert("site_id".to_string(), Value::from(self.site_id));
        fields.insert("title".to_string(), Value::from(title));
        fields.insert("content".to_string(), Value::from(content));
        for (name, value) in &self.extra_fields {
            fields.insert(name.clone(), value.clone());
        }
        FixtureRecord {
            pk,
            model: self.model.clone(),
            fields,
        }
    }
}

/// One-off construction without a configured template.
pub fn construct_fixture(
    pk: Option<i64>,
    title: &str,
    content: &str,
    extra_fields: &Map<String, Value>,
    model: &str,
    site_id: i64,
) -> FixtureRecord {
    FixtureTemplate {
        model: model.to_string(),
        site_id,
        extra_fields: extra_fields.clone(),
    }
    .construct(pk, title, content)
}

/// Records of one fixture file, remembered together with where they came from.
#[derive(Debug, Clone, PartialEq)]
pub struct FixtureSet {
    pub path: PathBuf,
    pub records: Vec<FixtureRecord>,
}

impl FixtureSet {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            records: parse_fixture_file(path)?,
        })
    }
}

pub fn parse_fixture_file(path: &Path) -> Result<Vec<FixtureRecord>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(SyncError::FixtureFileNotFound(path.to_path_buf()).into());
        }
        Err(error) => return Err(SyncError::io("read", path, error).into()),
    };
    parse_fixture_str(&text, path)
}

/// Parse fixture text. `origin` only labels errors.
pub fn parse_fixture_str(text: &str, origin: &Path) -> Result<Vec<FixtureRecord>> {
    let malformed = |reason: String| SyncError::MalformedFixture {
        path: origin.to_path_buf(),
        reason,
    };
    let missing = |index: usize, field: &'static str| SyncError::MissingField {
        path: origin.to_path_buf(),
        index,
        field,
    };

    let root: Value =
        serde_json::from_str(text).map_err(|error| malformed(format!("invalid JSON: {error}")))?;
    let Value::Array(items) = root else {
        return Err(malformed("top-level value must be an array".to_string()).into());
    };

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let Value::Object(mut object) = item else {
            return Err(malformed(format!("record #{index} is not an object")).into());
        };

        let pk = match object.remove("pk") {
            None => return Err(missing(index, "pk").into()),
            Some(Value::Null) => None,
            Some(value) => Some(value.as_i64().ok_or_else(|| {
                malformed(format!("record #{index} has a non-integer pk: {value}"))
            })?),
        };
        let model = match object.remove("model") {
            None => return Err(missing(index, "model").into()),
            Some(Value::String(model)) => model,
            Some(value) => {
                return Err(
                    malformed(format!("record #{index} has a non-string model: {value}")).into(),
                );
            }
        };
        let fields = match object.remove("fields") {
            None => return Err(missing(index, "fields").into()),
            Some(Value::Object(fields)) => fields,
            Some(value) => {
                return Err(
                    malformed(format!("record #{index} has non-object fields: {value}")).into(),
                );
            }
        };
        match fields.get("title") {
            None => return Err(missing(index, "fields.title").into()),
            Some(Value::String(_)) => {}
            Some(value) => {
                return Err(
                    malformed(format!("record #{index} has a non-string title: {value}")).into(),
                );
            }
        }

        records.push(FixtureRecord { pk, model, fields });
    }
    Ok(records)
}

pub fn serialize_fixture(records: &[FixtureRecord]) -> Result<String> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(FIXTURE_INDENT);
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    records
        .serialize(&mut serializer)
        .context("failed to serialize fixture records")?;
    let mut rendered = String::from_utf8(buffer).context("fixture JSON is not valid UTF-8")?;
    rendered.push('\n');
    Ok(rendered)
}

/// Every field name of every record, in order. Names shared by several
/// records are repeated.
pub fn list_available_fields(records: &[FixtureRecord]) -> Vec<String> {
    records
        .iter()
        .flat_map(|record| record.fields.keys().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    fn origin() -> PathBuf {
        PathBuf::from("fixtures.json")
    }

    fn error_of(result: Result<Vec<FixtureRecord>>) -> SyncError {
        let error = result.expect_err("must fail");
        match error.downcast::<SyncError>() {
            Ok(error) => error,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn construct_orders_base_fields_first() {
        let mut template = FixtureTemplate::default();
        template
            .extra_fields
            .insert("status".to_string(), json!(2));
        let record = template.construct(None, "Foo Bar", "body");

        assert_eq!(record.pk, None);
        assert_eq!(record.model, "blog.BlogPost");
        let keys: Vec<&str> = record.fields.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["site_id", "title", "content", "status"]);
        assert_eq!(record.title(), Some("Foo Bar"));
        assert_eq!(record.content(), Some("body"));
        assert_eq!(record.site_id(), Some(1));
    }

    #[test]
    fn construct_fixture_matches_template() {
        let extra = Map::from_iter([("author".to_string(), json!("jaya"))]);
        let record = construct_fixture(Some(9), "T", "C", &extra, "news.Item", 3);
        assert_eq!(record.pk, Some(9));
        assert_eq!(record.model, "news.Item");
        assert_eq!(record.site_id(), Some(3));
        assert_eq!(record.fields.get("author"), Some(&json!("jaya")));
    }

    #[test]
    fn extra_fields_override_base_fields() {
        let mut template = FixtureTemplate::default();
        template
            .extra_fields
            .insert("site_id".to_string(), json!(7));
        let record = template.construct(Some(3), "T", "C");
        assert_eq!(record.site_id(), Some(7));
        assert_eq!(record.fields.len(), 3);
    }

    #[test]
    fn serialize_uses_four_space_indent_and_field_order() {
        let record = FixtureTemplate::default().construct(None, "Foo Bar", "body");
        let rendered = serialize_fixture(&[record]).expect("serialize");
        let expected = r#"[
    {
        "pk": null,
        "model": "blog.BlogPost",
        "fields": {
            "site_id": 1,
            "title": "Foo Bar",
            "content": "body"
        }
    }
]
"#;
        assert_eq!(rendered, expected);
    }

    #[test]
    fn serialize_then_parse_roundtrip() {
        let template = FixtureTemplate::default();
        let records = vec![
            template.construct(Some(1), "First Post", "hello"),
            template.construct(None, "Draft", "ünïcode \"quoted\"\nline"),
        ];
        let rendered = serialize_fixture(&records).expect("serialize");
        let parsed = parse_fixture_str(&rendered, &origin()).expect("parse");
        assert_eq!(parsed, records);
    }

    #[test]
    fn parse_fixture_file_reports_missing_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("fixtures.json");
        let error = error_of(parse_fixture_file(&path));
        assert!(matches!(error, SyncError::FixtureFileNotFound(ref missing) if *missing == path));
    }

    #[test]
    fn parse_rejects_non_array_and_non_object() {
        assert!(matches!(
            error_of(parse_fixture_str("{\"pk\": 1}", &origin())),
            SyncError::MalformedFixture { .. }
        ));
        assert!(matches!(
            error_of(parse_fixture_str("[1, 2]", &origin())),
            SyncError::MalformedFixture { .. }
        ));
        assert!(matches!(
            error_of(parse_fixture_str("not json", &origin())),
            SyncError::MalformedFixture { .. }
        ));
    }

    #[test]
    fn parse_reports_missing_required_fields() {
        let cases = [
            (r#"[{"model": "m", "fields": {"title": "t"}}]"#, "pk"),
            (r#"[{"pk": 1, "fields": {"title": "t"}}]"#, "model"),
            (r#"[{"pk": 1, "model": "m"}]"#, "fields"),
            (r#"[{"pk": 1, "model": "m", "fields": {"content": "c"}}]"#, "fields.title"),
        ];
        for (text, expected) in cases {
            match error_of(parse_fixture_str(text, &origin())) {
                SyncError::MissingField { field, index, .. } => {
                    assert_eq!(field, expected);
                    assert_eq!(index, 0);
                }
                other => panic!("unexpected error for {text}: {other:?}"),
            }
        }
    }

    #[test]
    fn parse_rejects_wrongly_typed_pk() {
        let text = r#"[{"pk": "seven", "model": "m", "fields": {"title": "t"}}]"#;
        assert!(matches!(
            error_of(parse_fixture_str(text, &origin())),
            SyncError::MalformedFixture { .. }
        ));
    }

    #[test]
    fn list_available_fields_keeps_duplicates() {
        let text = r#"[
            {"pk": 1, "model": "blog.BlogPost", "fields": {"title": "A", "content": "x"}},
            {"pk": 2, "model": "blog.BlogPost", "fields": {"title": "B"}}
        ]"#;
        let records = parse_fixture_str(text, &origin()).expect("parse");
        assert_eq!(
            list_available_fields(&records),
            vec!["title", "content", "title"]
        );
    }
}
