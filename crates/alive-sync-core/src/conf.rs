//! Per-collection display and editing configuration.

use serde::Deserialize;

/// Fields that are never editable unless listed explicitly.
const NON_EDITABLE: [&str; 4] = ["id", "pk", "created_at", "updated_at"];

/// Field names tried, in order, when no title field is configured.
const TITLE_CANDIDATES: [&str; 4] = ["name", "title", "label", "subject"];

/// How a record collection is shown and edited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CollectionConf {
    /// Collection name, also used to derive the broadcast topic
    pub name: String,
    /// Fields to display, in display order. Empty means "whatever the record has".
    #[serde(default)]
    pub fields: Vec<String>,
    /// Fields that may be edited (default: `fields` minus id/timestamps)
    #[serde(default)]
    pub editable_fields: Option<Vec<String>>,
    /// Fields accepted on create (default: the editable fields)
    #[serde(default)]
    pub create_fields: Option<Vec<String>>,
    /// Field rendered as the record title
    #[serde(default)]
    pub title_field: Option<String>,
}

impl CollectionConf {
    /// Create a configuration showing `fields`, with every other setting
    /// defaulted.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Restrict editing to `fields`.
    #[must_use]
    pub fn with_editable_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.editable_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Use `field` as the record title.
    #[must_use]
    pub fn with_title_field(mut self, field: impl Into<String>) -> Self {
        self.title_field = Some(field.into());
        self
    }

    /// Fields that may be edited.
    #[must_use]
    pub fn editable_fields(&self) -> Vec<&str> {
        match &self.editable_fields {
            Some(fields) => fields.iter().map(String::as_str).collect(),
            None => self
                .fields
                .iter()
                .map(String::as_str)
                .filter(|f| !NON_EDITABLE.contains(f))
                .collect(),
        }
    }

    /// Whether `field` may be edited.
    ///
    /// With no field list configured, every field except id/timestamps is
    /// editable.
    #[must_use]
    pub fn is_editable(&self, field: &str) -> bool {
        if self.fields.is_empty() && self.editable_fields.is_none() {
            return !NON_EDITABLE.contains(&field);
        }
        self.editable_fields().contains(&field)
    }

    /// Whether `field` may be supplied when creating a record.
    #[must_use]
    pub fn is_creatable(&self, field: &str) -> bool {
        match &self.create_fields {
            Some(fields) => fields.iter().any(|f| f == field),
            None => self.is_editable(field),
        }
    }

    /// Field used as the record title.
    ///
    /// Falls back to the first of `name`, `title`, `label`, `subject` among
    /// `fields`, then to the first field.
    #[must_use]
    pub fn title_field(&self) -> Option<&str> {
        if let Some(title) = &self.title_field {
            return Some(title.as_str());
        }
        TITLE_CANDIDATES
            .iter()
            .find(|candidate| self.fields.iter().any(|f| f == *candidate))
            .copied()
            .or_else(|| self.fields.first().map(String::as_str))
    }

    /// Displayed fields other than the title field.
    #[must_use]
    pub fn content_fields(&self) -> Vec<&str> {
        let title = self.title_field();
        self.fields
            .iter()
            .map(String::as_str)
            .filter(|f| Some(*f) != title)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn editable_defaults_skip_ids_and_timestamps() {
        let conf = CollectionConf::new("cards", ["id", "title", "content", "created_at"]);
        assert_eq!(conf.editable_fields(), vec!["title", "content"]);
        assert!(conf.is_editable("content"));
        assert!(!conf.is_editable("id"));
        assert!(!conf.is_editable("unknown"));
    }

    #[test]
    fn explicit_editable_fields_win() {
        let conf = CollectionConf::new("cards", ["title", "content"]).with_editable_fields(["title"]);
        assert!(conf.is_editable("title"));
        assert!(!conf.is_editable("content"));
        assert!(conf.is_creatable("title"));
        assert!(!conf.is_creatable("content"));
    }

    #[test]
    fn title_field_fallbacks() {
        let conf = CollectionConf::new("meals", ["calories", "name", "title"]);
        assert_eq!(conf.title_field(), Some("name"));
        assert_eq!(conf.content_fields(), vec!["calories", "title"]);

        let conf = CollectionConf::new("notes", ["body", "tags"]);
        assert_eq!(conf.title_field(), Some("body"));

        let conf = conf.with_title_field("tags");
        assert_eq!(conf.title_field(), Some("tags"));
        assert_eq!(conf.content_fields(), vec!["body"]);
    }

    #[test]
    fn unconfigured_fields_allow_everything_but_ids() {
        let conf = CollectionConf::new("raw", Vec::<String>::new());
        assert!(conf.is_editable("anything"));
        assert!(!conf.is_editable("pk"));
        assert_eq!(conf.title_field(), None);
    }

    #[test]
    fn deserializes_from_json() {
        let conf: CollectionConf = serde_json::from_str(
            r#"{"name": "cards", "fields": ["title", "content"], "title_field": "title"}"#,
        )
        .unwrap();
        assert_eq!(conf.name, "cards");
        assert_eq!(conf.title_field(), Some("title"));
        assert!(conf.editable_fields.is_none());
    }
}
