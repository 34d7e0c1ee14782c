//! Name-key <-> schema id lookup built from one ontology snapshot.
//!
//! Scalar fields and enum parents are keyed by their field name; enum options
//! are keyed by `field<divider>option`. The tables are rebuilt for every sync
//! operation because the ontology can change between calls.

use std::collections::HashMap;
use std::sync::OnceLock;

use ltb_core::{Divider, MetadataKind, OntologySnapshot};

#[derive(Debug, Clone)]
pub struct SchemaTranslation {
    divider: Divider,
    // (schema id, name-key) in ontology order.
    entries: Vec<(String, String)>,
    id_to_name_key: HashMap<String, String>,
    name_key_to_id: OnceLock<HashMap<String, String>>,
}

impl SchemaTranslation {
    pub fn from_snapshot(snapshot: &OntologySnapshot, divider: &Divider) -> Self {
        let mut entries = Vec::new();
        for field in &snapshot.fields {
            entries.push((field.schema_id.clone(), field.name.clone()));
            if field.kind == MetadataKind::Enum {
                for option in &field.options {
                    entries.push((option.schema_id.clone(), divider.join(&field.name, &option.name)));
                }
            }
        }
        let id_to_name_key = entries.iter().cloned().collect();
        Self {
            divider: divider.clone(),
            entries,
            id_to_name_key,
            name_key_to_id: OnceLock::new(),
        }
    }

    pub fn divider(&self) -> &Divider {
        &self.divider
    }

    pub fn id_to_name_key(&self) -> &HashMap<String, String> {
        &self.id_to_name_key
    }

    /// Inverse table, built on first use. When two ids share a name-key the
    /// later one in ontology order wins.
    pub fn name_key_to_id(&self) -> &HashMap<String, String> {
        self.name_key_to_id.get_or_init(|| {
            self.entries
                .iter()
                .map(|(id, name_key)| (name_key.clone(), id.clone()))
                .collect()
        })
    }

    pub fn name_key(&self, schema_id: &str) -> Option<&str> {
        self.id_to_name_key.get(schema_id).map(String::as_str)
    }

    pub fn schema_id(&self, name_key: &str) -> Option<&str> {
        self.name_key_to_id().get(name_key).map(String::as_str)
    }

    /// Field name behind a schema id, for both field ids and option ids.
    pub fn field_name(&self, schema_id: &str) -> Option<&str> {
        let name_key = self.name_key(schema_id)?;
        Some(
            self.divider
                .split(name_key)
                .map_or(name_key, |(field, _)| field),
        )
    }

    /// Option id for `field<divider>raw` when it exists, otherwise `raw`.
    pub fn value_for_upload(&self, field: &str, raw: &str) -> String {
        self.schema_id(&self.divider.join(field, raw))
            .map_or_else(|| raw.to_string(), str::to_string)
    }

    /// Human-readable form of a stored value: option ids become option names.
    pub fn value_for_display(&self, value: &str) -> String {
        match self.name_key(value).and_then(|key| self.divider.split(key)) {
            Some((_, option)) => option.to_string(),
            None => value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltb_core::{SchemaField, SchemaOption};

    fn field(id: &str, name: &str, kind: MetadataKind, options: &[(&str, &str)]) -> SchemaField {
        SchemaField {
            schema_id: id.to_string(),
            name: name.to_string(),
            kind,
            options: options
                .iter()
                .map(|(id, name)| SchemaOption {
                    schema_id: id.to_string(),
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    fn snapshot() -> OntologySnapshot {
        OntologySnapshot {
            fields: vec![
                field("f-note", "note", MetadataKind::String, &[]),
                field(
                    "f-weather",
                    "weather",
                    MetadataKind::Enum,
                    &[("o-rain", "rain"), ("o-sun", "sun")],
                ),
                field("f-score", "score", MetadataKind::Number, &[]),
            ],
        }
    }

    #[test]
    fn maps_fields_parents_and_options() {
        let t = SchemaTranslation::from_snapshot(&snapshot(), &Divider::default());
        assert_eq!(t.name_key("f-note"), Some("note"));
        assert_eq!(t.name_key("f-weather"), Some("weather"));
        assert_eq!(t.name_key("o-rain"), Some("weather///rain"));
        assert_eq!(t.schema_id("weather///sun"), Some("o-sun"));
        assert_eq!(t.field_name("o-sun"), Some("weather"));
        assert_eq!(t.id_to_name_key().len(), 5);
    }

    #[test]
    fn inverse_is_exact_without_collisions() {
        let t = SchemaTranslation::from_snapshot(&snapshot(), &Divider::default());
        assert_eq!(t.name_key_to_id().len(), t.id_to_name_key().len());
        for (id, name_key) in t.id_to_name_key() {
            assert_eq!(t.name_key_to_id().get(name_key), Some(id));
        }
    }

    #[test]
    fn values_translate_in_both_directions() {
        let t = SchemaTranslation::from_snapshot(&snapshot(), &Divider::default());
        assert_eq!(t.value_for_upload("weather", "rain"), "o-rain");
        assert_eq!(t.value_for_upload("weather", "hail"), "hail");
        assert_eq!(t.value_for_upload("note", "anything"), "anything");
        assert_eq!(t.value_for_display("o-sun"), "sun");
        assert_eq!(t.value_for_display("free text"), "free text");
    }

    #[test]
    fn custom_dividers_shape_name_keys() {
        let divider = Divider::new("::").unwrap();
        let t = SchemaTranslation::from_snapshot(&snapshot(), &divider);
        assert_eq!(t.name_key("o-rain"), Some("weather::rain"));
        assert_eq!(t.value_for_upload("weather", "sun"), "o-sun");
    }

    #[test]
    fn later_option_wins_on_name_key_collision() {
        let mut snap = snapshot();
        snap.fields.push(field("f-weather-2", "weather///rain", MetadataKind::String, &[]));
        let t = SchemaTranslation::from_snapshot(&snap, &Divider::default());
        assert_eq!(t.schema_id("weather///rain"), Some("f-weather-2"));
        assert_eq!(t.name_key("o-rain"), Some("weather///rain"));
    }
}
