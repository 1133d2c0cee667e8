//! Field-map driven extraction of typed records from `EOPMetadata.xml`
use crate::datetime::parse_datetime;
use crate::error::{Error, Result};
use crate::eumetsat::ProductId;
use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

pub const METADATA_FILE: &str = "EOPMetadata.xml";
pub const MANIFEST_FILE: &str = "manifest.xml";

/// Files captured into the store and then discarded.
pub const TRANSIENT_FILES: [&str; 2] = [METADATA_FILE, MANIFEST_FILE];

/// Column names the store reserves for itself.
pub const RESERVED_FIELDS: [&str; 2] = ["id", "downloaded"];

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Datetime,
    Str,
    Int,
    Float,
}

type Coercion = fn(&str) -> std::result::Result<FieldValue, String>;

impl Datatype {
    pub fn coercion(self: Self) -> Coercion {
        match self {
            Self::Datetime => coerce_datetime,
            Self::Str => coerce_str,
            Self::Int => coerce_int,
            Self::Float => coerce_float,
        }
    }

    pub fn as_str(self: Self) -> &'static str {
        match self {
            Self::Datetime => "datetime",
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "datetime" => Some(Self::Datetime),
            "str" => Some(Self::Str),
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            _ => None,
        }
    }
}

fn coerce_datetime(raw: &str) -> std::result::Result<FieldValue, String> {
    parse_datetime(raw)
        .map(FieldValue::Datetime)
        .ok_or_else(|| format!("'{raw}' is not a recognised date/time"))
}

fn coerce_str(raw: &str) -> std::result::Result<FieldValue, String> {
    Ok(FieldValue::Str(raw.to_string()))
}

fn coerce_int(raw: &str) -> std::result::Result<FieldValue, String> {
    raw.trim()
        .parse::<i64>()
        .map(FieldValue::Int)
        .map_err(|e| format!("'{raw}' is not an integer: {e}"))
}

fn coerce_float(raw: &str) -> std::result::Result<FieldValue, String> {
    raw.trim()
        .parse::<f64>()
        .map(FieldValue::Float)
        .map_err(|e| format!("'{raw}' is not a float: {e}"))
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Datetime(DateTime<Utc>),
    Str(String),
    Int(i64),
    Float(f64),
}

impl FieldValue {
    pub fn datatype(self: &Self) -> Datatype {
        match self {
            Self::Datetime(_) => Datatype::Datetime,
            Self::Str(_) => Datatype::Str,
            Self::Int(_) => Datatype::Int,
            Self::Float(_) => Datatype::Float,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Datetime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.3f")),
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct FieldSpec {
    pub name: String,
    pub datatype: Datatype,
    /// Path into the document: `prefix:Element` steps into a child, `@prefix:attr`
    /// selects an attribute and `#text` the element's text.
    pub location: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct FieldMap {
    pub product_id: ProductId,
    /// Extension of the retained data file, e.g. `nat` for `{dataset_id}.nat`.
    pub primary_suffix: String,
    pub fields: Vec<FieldSpec>,
}

impl FieldMap {
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let map: Self = toml::from_str(&content)?;
        map.validate()?;
        Ok(map)
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        let map: Self = toml::from_str(&table.to_string())
            .map_err(|e| Error::Config(format!("Invalid field map template: {e}")))?;
        map.validate()?;
        Ok(map)
    }

    /// The maps shipped with the crate.
    pub fn builtin() -> Result<Vec<Self>> {
        Self::from_templates(&[msg15rss::field_map_toml()])
    }

    /// Fails on the first invalid template.
    pub fn from_templates(tables: &[toml::Table]) -> Result<Vec<Self>> {
        tables.iter().map(Self::from_template).collect()
    }

    /// Field names become store columns, so they must be plain identifiers.
    pub fn validate(self: &Self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(Error::Config(format!(
                "Field map for {} defines no fields",
                self.product_id
            )));
        }
        for field in &self.fields {
            if !is_identifier(&field.name) || RESERVED_FIELDS.contains(&field.name.as_str()) {
                return Err(Error::Config(format!(
                    "Invalid field name '{}' in field map for {}",
                    field.name, self.product_id
                )));
            }
            if field.location.is_empty() {
                return Err(Error::Config(format!("Field '{}' has no location", field.name)));
            }
        }
        Ok(())
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses `xml` and extracts every field of `field_map`, in map order.
pub fn extract_metadata(xml: &str, field_map: &FieldMap) -> Result<Vec<(String, FieldValue)>> {
    let doc = Document::parse(xml).map_err(|e| Error::MetadataParse {
        field: "<document>".to_string(),
        reason: e.to_string(),
    })?;

    field_map
        .fields
        .iter()
        .map(|spec| {
            let fail = |reason: String| Error::MetadataParse {
                field: spec.name.clone(),
                reason,
            };
            let raw = locate(&doc, &spec.location).map_err(fail)?;
            let value = (spec.datatype.coercion())(&raw).map_err(fail)?;
            Ok((spec.name.clone(), value))
        })
        .collect()
}

/// Reads `EOPMetadata.xml` from an extraction directory.
pub fn extract_metadata_file(
    dir: &Path,
    field_map: &FieldMap,
) -> Result<Vec<(String, FieldValue)>> {
    let path = dir.join(METADATA_FILE);
    let xml = fs::read_to_string(&path).map_err(|e| Error::MetadataParse {
        field: "<document>".to_string(),
        reason: format!("Unable to read {}: {e}", path.display()),
    })?;
    extract_metadata(&xml, field_map)
}

fn locate(doc: &Document, location: &[String]) -> std::result::Result<String, String> {
    let (first, rest) = location
        .split_first()
        .ok_or_else(|| "empty location".to_string())?;

    let mut node = doc.root_element();
    if !element_matches(node, first) {
        return Err(format!("root element is not '{first}'"));
    }

    for (i, segment) in rest.iter().enumerate() {
        let is_last = i == rest.len() - 1;

        if segment == "#text" {
            return match (is_last, node.text()) {
                (true, Some(text)) => Ok(text.trim().to_string()),
                (true, None) => Err(format!("'{}' has no text", qualified(node))),
                (false, _) => Err("'#text' must be the final segment".to_string()),
            };
        }

        if let Some(attr) = segment.strip_prefix('@') {
            if !is_last {
                return Err(format!("attribute '{segment}' must be the final segment"));
            }
            return attribute_value(node, attr)
                .ok_or_else(|| format!("'{}' has no attribute '{attr}'", qualified(node)));
        }

        node = node
            .children()
            .find(|n| element_matches(*n, segment))
            .ok_or_else(|| format!("'{}' has no child '{segment}'", qualified(node)))?;
    }

    // Ending on an element is only meaningful for leaves
    if node.children().any(|n| n.is_element()) {
        return Err(format!("'{}' is not a leaf element", qualified(node)));
    }
    Ok(node.text().unwrap_or_default().trim().to_string())
}

fn split_qname(segment: &str) -> (Option<&str>, &str) {
    match segment.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, segment),
    }
}

/// Matches the local name, and the namespace when the prefix is declared in scope.
fn element_matches(node: Node, segment: &str) -> bool {
    if !node.is_element() {
        return false;
    }
    let (prefix, local) = split_qname(segment);
    if node.tag_name().name() != local {
        return false;
    }
    match node.lookup_namespace_uri(prefix) {
        Some(uri) => node.tag_name().namespace() == Some(uri),
        None => prefix.is_some() || node.tag_name().namespace().is_none(),
    }
}

fn attribute_value(node: Node, segment: &str) -> Option<String> {
    let (prefix, local) = split_qname(segment);
    let namespace = prefix.and_then(|p| node.lookup_namespace_uri(Some(p)));
    node.attributes()
        .find(|a| {
            a.name() == local
                && match (prefix, namespace) {
                    (None, _) => a.namespace().is_none(),
                    (Some(_), Some(uri)) => a.namespace() == Some(uri),
                    (Some(_), None) => true,
                }
        })
        .map(|a| a.value().to_string())
}

fn qualified(node: Node) -> String {
    let tag = node.tag_name();
    match tag.namespace().and_then(|ns| node.lookup_prefix(ns)) {
        Some(prefix) => format!("{prefix}:{}", tag.name()),
        None => tag.name().to_string(),
    }
}

/// MSG 1.5 Rapid Scan Service (SEVIRI, 5 minute cadence over Europe)
pub mod msg15rss {
    pub fn field_map_toml() -> toml::Table {
        toml::toml! {
            product_id = "EO:EUM:DAT:MSG:MSG15-RSS"
            primary_suffix = "nat"

            [[fields]]
            name = "start_date"
            datatype = "datetime"
            location = ["eum:EarthObservation", "om:phenomenonTime", "gml:TimePeriod", "gml:beginPosition"]

            [[fields]]
            name = "end_date"
            datatype = "datetime"
            location = ["eum:EarthObservation", "om:phenomenonTime", "gml:TimePeriod", "gml:endPosition"]

            [[fields]]
            name = "result_time"
            datatype = "datetime"
            location = ["eum:EarthObservation", "om:resultTime", "gml:TimeInstant", "gml:timePosition"]

            [[fields]]
            name = "platform_short_name"
            datatype = "str"
            location = ["eum:EarthObservation", "om:procedure", "eop:EarthObservationEquipment", "eop:platform", "eop:Platform", "eop:shortName"]

            [[fields]]
            name = "platform_orbit_type"
            datatype = "str"
            location = ["eum:EarthObservation", "om:procedure", "eop:EarthObservationEquipment", "eop:platform", "eop:Platform", "eop:orbitType"]

            [[fields]]
            name = "instrument_name"
            datatype = "str"
            location = ["eum:EarthObservation", "om:procedure", "eop:EarthObservationEquipment", "eop:instrument", "eop:Instrument", "eop:shortName"]

            [[fields]]
            name = "sensor_op_mode"
            datatype = "str"
            location = ["eum:EarthObservation", "om:procedure", "eop:EarthObservationEquipment", "eop:sensor", "eop:Sensor", "eop:operationalMode"]

            [[fields]]
            name = "center_srs_name"
            datatype = "str"
            location = ["eum:EarthObservation", "om:featureOfInterest", "eop:Footprint", "eop:centerOf", "gml:Point", "@srsName"]

            [[fields]]
            name = "center_position"
            datatype = "str"
            location = ["eum:EarthObservation", "om:featureOfInterest", "eop:Footprint", "eop:centerOf", "gml:Point", "gml:pos"]

            [[fields]]
            name = "file_name"
            datatype = "str"
            location = ["eum:EarthObservation", "om:result", "eop:EarthObservationResult", "eop:product", "eop:ProductInformation", "eop:fileName", "ows:ServiceReference", "@xlink:href"]

            [[fields]]
            name = "file_size"
            datatype = "int"
            location = ["eum:EarthObservation", "om:result", "eop:EarthObservationResult", "eop:product", "eop:ProductInformation", "eop:size", "#text"]

            [[fields]]
            name = "missing_pct"
            datatype = "float"
            location = ["eum:EarthObservation", "eop:metaDataProperty", "eum:EarthObservationMetaData", "eum:missingData", "#text"]
        }
    }
}
