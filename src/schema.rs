use serde::{ Deserialize, Deserializer, Serialize, Serializer };
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{ Result, SearchError };

/// Logical value type of an index field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Text,
    Number,
}

impl LogicalType {
    /// Name of the type in the hosted service's entity data model.
    pub fn native_type(&self) -> &'static str {
        match self {
            LogicalType::Text => "Edm.String",
            LogicalType::Number => "Edm.Double",
        }
    }
}

impl FromStr for LogicalType {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "string" | "system.string" | "edm.string" => Ok(LogicalType::Text),
            "number" | "double" | "system.double" | "edm.double" => Ok(LogicalType::Number),
            _ => Err(SearchError::Configuration(format!("unrecognized logical type '{}'", s))),
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Text => write!(f, "text"),
            LogicalType::Number => write!(f, "number"),
        }
    }
}

impl Serialize for LogicalType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LogicalType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Describes one field of an index: its name, type and what the service may do with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub is_searchable: bool,
    #[serde(default)]
    pub is_filterable: bool,
    #[serde(default)]
    pub is_sortable: bool,
    #[serde(default)]
    pub is_facetable: bool,
    #[serde(default = "default_retrievable")]
    pub is_retrievable: bool,
}

fn default_retrievable() -> bool {
    true
}

impl FieldSchema {
    /// A retrievable field with every other capability switched off.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            is_key: false,
            is_searchable: false,
            is_filterable: false,
            is_sortable: false,
            is_facetable: false,
            is_retrievable: true,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Text)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, LogicalType::Number)
    }

    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.is_searchable = true;
        self
    }

    pub fn filterable(mut self) -> Self {
        self.is_filterable = true;
        self
    }

    pub fn sortable(mut self) -> Self {
        self.is_sortable = true;
        self
    }

    pub fn facetable(mut self) -> Self {
        self.is_facetable = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.is_retrievable = false;
        self
    }
}

/// A named set of fields used as the source for autocomplete queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggesterDefinition {
    pub name: String,
    pub source_field_names: Vec<String>,
}

impl SuggesterDefinition {
    pub fn new<I, S>(name: impl Into<String>, source_field_names: I) -> Self
        where I: IntoIterator<Item = S>, S: Into<String>
    {
        Self {
            name: name.into(),
            source_field_names: source_field_names.into_iter().map(Into::into).collect(),
        }
    }
}

/// Represents the schema of a single search index.
///
/// Index definitions are immutable on the remote side: changing the schema
/// means deleting the index and creating it again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggester: Option<SuggesterDefinition>,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSchema>) -> Self {
        Self {
            name: name.into(),
            fields,
            suggester: None,
        }
    }

    pub fn with_suggester(mut self, suggester: SuggesterDefinition) -> Self {
        self.suggester = Some(suggester);
        self
    }

    /// Same schema under a different index name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    pub fn key_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.is_key)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks the structural rules the remote service would otherwise reject.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SearchError::Configuration("index name must not be empty".into()));
        }
        if self.fields.is_empty() {
            return Err(
                SearchError::Configuration(format!("index '{}' declares no fields", self.name))
            );
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(
                    SearchError::Configuration(
                        format!("index '{}' declares field '{}' twice", self.name, field.name)
                    )
                );
            }
        }

        let keys = self.fields
            .iter()
            .filter(|f| f.is_key)
            .count();
        if keys != 1 {
            return Err(
                SearchError::Configuration(
                    format!("index '{}' must have exactly one key field, found {}", self.name, keys)
                )
            );
        }

        if let Some(suggester) = &self.suggester {
            if suggester.source_field_names.is_empty() {
                return Err(
                    SearchError::Configuration(
                        format!("suggester '{}' has no source fields", suggester.name)
                    )
                );
            }
            for source in &suggester.source_field_names {
                if !seen.contains(source.as_str()) {
                    return Err(
                        SearchError::Configuration(
                            format!(
                                "suggester '{}' references unknown field '{}'",
                                suggester.name,
                                source
                            )
                        )
                    );
                }
            }
        }
        Ok(())
    }
}

/// Represents the structure of a schema file (e.g., schema.json).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchemaFile {
    pub indexes: Vec<IndexDefinition>,
}

impl SchemaFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Unknown field types fail as configuration errors, malformed JSON as
    /// serialization errors.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text)?;
        check_field_types(&raw)?;
        let file: SchemaFile = serde_json::from_value(raw)?;
        for index in &file.indexes {
            index.validate()?;
        }
        Ok(file)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

fn check_field_types(raw: &Value) -> Result<()> {
    let indexes = raw.get("indexes").and_then(Value::as_array).into_iter().flatten();
    for index in indexes {
        let fields = index.get("fields").and_then(Value::as_array).into_iter().flatten();
        for field in fields {
            if let Some(type_name) = field.get("type").and_then(Value::as_str) {
                type_name.parse::<LogicalType>()?;
            }
        }
    }
    Ok(())
}
