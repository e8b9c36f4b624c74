//! Rewrites CR specs into the legacy proxy admin-API shape, driven by a
//! YAML database of OpenAPI-like schemas annotated with `x-l7mp-old-*`
//! hints. The proxy still validates against its pre-structural schema, so
//! every spec goes through here before it is POSTed.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::util::Error;

#[derive(Debug, Clone, Default, PartialEq)]
struct Annotations {
    /// `x-l7mp-old-name`: emit the node under this key in the parent.
    old_name: Option<String>,
    /// `x-l7mp-old-remove-level`: replace the value with its single child.
    remove_level: bool,
    /// `x-l7mp-old-property`: hoist the first child, injecting its key as
    /// this property.
    property: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum ConvSchema {
    Object {
        properties: BTreeMap<String, ConvSchema>,
        annotations: Annotations,
    },
    Array {
        items: Box<ConvSchema>,
    },
    Leaf {
        annotations: Annotations,
    },
}

/// The downgrade database: one schema per CRD plural, loaded once.
#[derive(Debug, Default)]
pub struct ConvDb {
    schemas: BTreeMap<String, ConvSchema>,
}

impl ConvDb {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses a multi-document YAML stream of CRD-shaped wrappers. Each
    /// document must expose exactly one version.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut schemas = BTreeMap::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let doc = Value::deserialize(document)?;
            let Some(plural) = doc
                .pointer("/spec/names/plural")
                .and_then(Value::as_str)
                .map(str::to_owned)
            else {
                continue;
            };
            let versions = doc
                .pointer("/spec/versions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if versions.len() != 1 {
                return Err(Error::Downgrade(format!(
                    "conversion schema for {plural} must carry exactly one version"
                )));
            }
            let spec_schema = versions[0]
                .pointer("/schema/openAPIV3Schema/properties/spec")
                .ok_or_else(|| {
                    Error::Downgrade(format!("conversion schema for {plural} has no spec schema"))
                })?;
            schemas.insert(plural, parse_node(spec_schema)?);
        }
        Ok(ConvDb { schemas })
    }

    /// Rewrites a spec object for the legacy admin API.
    pub fn downgrade(&self, plural: &str, spec: &Value) -> Result<Value, Error> {
        let schema = self
            .schemas
            .get(plural)
            .ok_or_else(|| Error::Downgrade(format!("no conversion schema for {plural}")))?;
        let (_, converted) = convert_sub(schema, "spec", Some(spec.clone()));
        Ok(converted.unwrap_or(Value::Null))
    }
}

fn parse_annotations(node: &serde_json::Map<String, Value>) -> Result<Annotations, Error> {
    let mut annotations = Annotations::default();
    for (key, value) in node {
        if !key.starts_with("x-l7mp-old") {
            continue;
        }
        match key.as_str() {
            "x-l7mp-old-name" => {
                annotations.old_name = value.as_str().map(str::to_owned);
            }
            "x-l7mp-old-remove-level" => {
                annotations.remove_level = value.as_bool().unwrap_or(false);
            }
            "x-l7mp-old-property" => {
                annotations.property = value.as_str().map(str::to_owned);
            }
            other => {
                return Err(Error::Downgrade(format!("unknown annotation: {other}")));
            }
        }
    }
    Ok(annotations)
}

fn parse_node(value: &Value) -> Result<ConvSchema, Error> {
    let node = value
        .as_object()
        .ok_or_else(|| Error::Downgrade(format!("schema node must be a mapping, got: {value}")))?;
    let annotations = parse_annotations(node)?;

    if let Some(properties) = node.get("properties").and_then(Value::as_object) {
        let mut parsed = BTreeMap::new();
        for (key, child) in properties {
            // Annotation-looking keys are hints, never properties.
            if key.starts_with("x-l7mp-old") {
                continue;
            }
            parsed.insert(key.clone(), parse_node(child)?);
        }
        return Ok(ConvSchema::Object {
            properties: parsed,
            annotations,
        });
    }
    if let Some(items) = node.get("items") {
        return Ok(ConvSchema::Array {
            items: Box::new(parse_node(items)?),
        });
    }
    Ok(ConvSchema::Leaf { annotations })
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

fn convert_sub(schema: &ConvSchema, key: &str, obj: Option<Value>) -> (String, Option<Value>) {
    let Some(mut obj) = obj else {
        return (key.to_string(), None);
    };

    let annotations = match schema {
        ConvSchema::Object {
            properties,
            annotations,
        } => {
            for (k, child) in properties {
                let current = obj.get(k).cloned();
                let (new_key, converted) = convert_sub(child, k, current);
                if let Some(map) = obj.as_object_mut() {
                    if let Some(converted) = converted.filter(is_present) {
                        map.insert(new_key.clone(), converted);
                    }
                    if new_key != *k {
                        map.remove(k);
                    }
                }
            }
            annotations
        }
        ConvSchema::Array { items } => {
            // Array nodes delegate entirely to their item schema.
            if let Some(entries) = obj.as_array() {
                let converted = entries
                    .iter()
                    .map(|item| convert_sub(items, "_", Some(item.clone())).1)
                    .map(|item| item.unwrap_or(Value::Null))
                    .collect();
                return (key.to_string(), Some(Value::Array(converted)));
            }
            return (key.to_string(), Some(obj));
        }
        ConvSchema::Leaf { annotations } => annotations,
    };

    let key = annotations.old_name.clone().unwrap_or_else(|| key.to_string());
    if annotations.remove_level {
        let child = obj.as_object().and_then(|m| m.values().next()).cloned();
        if let Some(child) = child {
            obj = child;
        }
    }
    if let Some(property) = &annotations.property {
        let first = obj
            .as_object()
            .and_then(|m| m.iter().next())
            .map(|(k, v)| (k.clone(), v.clone()));
        if let Some((subkey, child)) = first {
            obj = child;
            if let Some(map) = obj.as_object_mut() {
                map.insert(property.clone(), Value::String(subkey));
            }
        }
    }
    (key, Some(obj))
}
