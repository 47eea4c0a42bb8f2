//! Source-to-target column type mapping.
//!
//! A sink that creates or alters tables in a different database family
//! renames column types on the way through `SinkConnector::target_schema`.
//! Lookups ignore case, time zone qualifiers and length or precision
//! arguments; the arguments are carried over to the mapped type.

use cdcflow_core::SchemaVersion;
use std::collections::BTreeMap;

/// Column type renames applied to schemas handed to a sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeMap {
    mappings: BTreeMap<String, String>,
}

impl TypeMap {
    /// An empty map; types pass through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// PostgreSQL source types to MySQL target types.
    pub fn postgres_to_mysql() -> Self {
        Self::from_pairs(&[
            ("BIGINT", "BIGINT"),
            ("INTEGER", "INT"),
            ("INT4", "INT"),
            ("INT8", "BIGINT"),
            ("SMALLINT", "SMALLINT"),
            ("SERIAL", "BIGINT"),
            ("BIGSERIAL", "BIGINT"),
            ("NUMERIC", "DECIMAL"),
            ("REAL", "FLOAT"),
            ("DOUBLE PRECISION", "DOUBLE"),
            ("VARCHAR", "VARCHAR"),
            ("CHARACTER VARYING", "VARCHAR"),
            ("CHAR", "CHAR"),
            ("TEXT", "TEXT"),
            ("BOOLEAN", "TINYINT(1)"),
            ("DATE", "DATE"),
            ("TIMESTAMP", "DATETIME"),
            ("TIMESTAMPTZ", "DATETIME"),
            ("TIME", "TIME"),
            ("JSON", "JSON"),
            ("JSONB", "JSON"),
            ("UUID", "CHAR(36)"),
            ("BYTEA", "BLOB"),
        ])
    }

    /// MySQL source types to PostgreSQL target types.
    pub fn mysql_to_postgres() -> Self {
        Self::from_pairs(&[
            ("BIGINT", "BIGINT"),
            ("INT", "INTEGER"),
            ("SMALLINT", "SMALLINT"),
            ("DECIMAL", "NUMERIC"),
            ("FLOAT", "REAL"),
            ("DOUBLE", "DOUBLE PRECISION"),
            ("VARCHAR", "VARCHAR"),
            ("CHAR", "CHAR"),
            ("TEXT", "TEXT"),
            ("TINYINT(1)", "BOOLEAN"),
            ("DATE", "DATE"),
            ("DATETIME", "TIMESTAMP"),
            ("TIME", "TIME"),
            ("JSON", "JSONB"),
            ("BLOB", "BYTEA"),
        ])
    }

    fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        pairs
            .iter()
            .fold(Self::new(), |map, (source, target)| map.with(source, target))
    }

    /// Adds or replaces one rename. `source` is matched case-insensitively.
    #[must_use]
    pub fn with(mut self, source: &str, target: &str) -> Self {
        self.mappings
            .insert(source.trim().to_ascii_uppercase(), target.to_string());
        self
    }

    /// Returns true if no renames are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Maps one column type.
    ///
    /// Unmapped types are returned normalised to upper case without time
    /// zone qualifiers. With an empty map the type is returned unchanged.
    #[must_use]
    pub fn convert_type(&self, data_type: &str) -> String {
        if self.is_empty() {
            return data_type.to_string();
        }
        let normalized = data_type
            .trim()
            .to_ascii_uppercase()
            .replace(" WITHOUT TIME ZONE", "")
            .replace(" WITH TIME ZONE", "");

        // whole-type entries such as TINYINT(1) win over the base lookup
        if let Some(target) = self.mappings.get(&normalized) {
            return target.clone();
        }

        let (base, args) = match normalized.find('(') {
            Some(open) => {
                let close = normalized[open..]
                    .find(')')
                    .map_or(normalized.len(), |i| open + i + 1);
                (normalized[..open].trim(), &normalized[open..close])
            }
            None => (normalized.as_str(), ""),
        };
        let mapped = self.mappings.get(base).map_or(base, String::as_str);
        if args.is_empty() || mapped.contains('(') {
            mapped.to_string()
        } else {
            format!("{mapped}{args}")
        }
    }

    /// Returns `schema` with every column type mapped.
    #[must_use]
    pub fn convert_schema(&self, schema: &SchemaVersion) -> SchemaVersion {
        let mut converted = schema.clone();
        for column in &mut converted.columns {
            column.data_type = self.convert_type(&column.data_type);
        }
        converted
    }
}
