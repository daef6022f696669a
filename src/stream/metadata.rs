//! Metadata Handler
//!
//! Turns the first metadata document seen for a stream key into a registry
//! entry: validates the schema fields the data path depends on, derives the
//! output topics, appends one provenance record to `"Analysis chain"` and
//! caches the serialized result for republishing.

use chrono::Utc;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{json, Map, Value};
use std::time::Instant;

use super::codec::{ElementType, SampleCount};
use super::error::{MetadataError, StreamError};
use super::registry::StreamState;
use super::topic::StreamKey;
use crate::transform::Stage;

pub const DATA_FIELD: &str = "Data";
pub const ANALYSIS_CHAIN_FIELD: &str = "Analysis chain";

/// Layout and timing information extracted from a metadata document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSchema {
    pub sample_count: SampleCount,
    pub element_type: ElementType,
    /// `1 / "Analysis chain"[0].Sampling`, when the stage needs it.
    pub sampling_interval: Option<f64>,
}

fn data_section(doc: &Map<String, Value>) -> Result<&Map<String, Value>, MetadataError> {
    doc.get(DATA_FIELD)
        .ok_or(MetadataError::MissingField("Data"))?
        .as_object()
        .ok_or_else(|| MetadataError::InvalidField {
            field: "Data",
            message: "expected an object".to_string(),
        })
}

fn analysis_chain(doc: &Map<String, Value>) -> Result<&Vec<Value>, MetadataError> {
    doc.get(ANALYSIS_CHAIN_FIELD)
        .ok_or(MetadataError::MissingField("Analysis chain"))?
        .as_array()
        .ok_or_else(|| MetadataError::InvalidField {
            field: "Analysis chain",
            message: "expected an array".to_string(),
        })
}

/// Extract the stream layout, rejecting documents the data path could not use.
pub fn parse_schema(
    doc: &Map<String, Value>,
    requires_sampling: bool,
) -> Result<StreamSchema, MetadataError> {
    let data = data_section(doc)?;

    let samples = data
        .get("Samples")
        .ok_or(MetadataError::MissingField("Data.Samples"))?;
    let sample_count = match samples.as_i64() {
        Some(SampleCount::DERIVED_SENTINEL) => SampleCount::Derived,
        Some(n) if n > 0 => usize::try_from(n)
            .map(SampleCount::Fixed)
            .map_err(|e| MetadataError::InvalidField {
                field: "Data.Samples",
                message: e.to_string(),
            })?,
        _ => {
            return Err(MetadataError::InvalidField {
                field: "Data.Samples",
                message: format!("expected a positive integer or -1, got {}", samples),
            })
        }
    };

    let type_code = data
        .get("Type")
        .ok_or(MetadataError::MissingField("Data.Type"))?;
    let element_type = type_code
        .as_str()
        .and_then(ElementType::from_type_code)
        .ok_or_else(|| MetadataError::InvalidField {
            field: "Data.Type",
            message: format!("unsupported type code {}", type_code),
        })?;

    let chain = analysis_chain(doc)?;

    let sampling_interval = if requires_sampling {
        let sampling = chain
            .first()
            .and_then(|record| record.get("Sampling"))
            .ok_or(MetadataError::MissingField("Analysis chain[0].Sampling"))?;
        match sampling.as_f64() {
            Some(hz) if hz.is_finite() && hz > 0.0 => Some(1.0 / hz),
            _ => {
                return Err(MetadataError::InvalidField {
                    field: "Analysis chain[0].Sampling",
                    message: format!("expected a positive rate in Hz, got {}", sampling),
                })
            }
        }
    } else {
        None
    };

    Ok(StreamSchema {
        sample_count,
        element_type,
        sampling_interval,
    })
}

/// Append the stage's provenance record and, if the stage changes units,
/// overwrite `Data.Unit`. Every other field is left as received.
pub fn augment(doc: &mut Map<String, Value>, stage: &Stage) -> Result<(), MetadataError> {
    let (name, output) = stage.analysis_record();

    match doc.get_mut(ANALYSIS_CHAIN_FIELD).and_then(Value::as_array_mut) {
        Some(chain) => chain.push(json!({ "Name": name, "Output": output })),
        None => return Err(MetadataError::MissingField("Analysis chain")),
    }

    if let Some(unit) = stage.output_unit() {
        match doc.get_mut(DATA_FIELD).and_then(Value::as_object_mut) {
            Some(data) => {
                data.insert("Unit".to_string(), Value::String(unit.to_string()));
            }
            None => return Err(MetadataError::MissingField("Data")),
        }
    }

    Ok(())
}

/// Serialize with 4-space indentation, keeping document key order.
pub fn to_pretty_json(doc: &Map<String, Value>) -> Result<Vec<u8>, MetadataError> {
    let mut buf = Vec::with_capacity(256);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    doc.serialize(&mut ser)?;
    Ok(buf)
}

/// Build the registry entry for a key seen for the first time.
///
/// Pure with respect to the registry: on any error nothing is created.
pub fn build_entry(
    key: &StreamKey,
    payload: &[u8],
    stage: &Stage,
    now: Instant,
) -> Result<StreamState, StreamError> {
    let mut doc = match serde_json::from_slice::<Value>(payload).map_err(MetadataError::from)? {
        Value::Object(map) => map,
        other => {
            return Err(MetadataError::InvalidField {
                field: "document",
                message: format!("expected a JSON object, got {}", json_kind(&other)),
            }
            .into())
        }
    };

    let schema = parse_schema(&doc, stage.requires_sampling())?;
    let (output_metadata_topic, output_data_topic) = stage.rewrite.output_topics(key)?;

    augment(&mut doc, stage)?;
    let serialized_metadata = to_pretty_json(&doc)?;

    let wall = Utc::now();
    Ok(StreamState {
        sample_count: schema.sample_count,
        element_type: schema.element_type,
        output_metadata_topic,
        output_data_topic,
        serialized_metadata,
        transform: stage.initial_state(schema.sampling_interval),
        frames_processed: 0,
        created_at: wall,
        last_activity: wall,
        last_touched: now,
        touch_seq: 0,
    })
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
