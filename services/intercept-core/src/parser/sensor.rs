//! rtl_433 output: one JSON object per line (`-F json`), or `key=value` pairs
//! from the kv/csv-ish formats. Measurements are normalised to °C, hPa, m/s
//! and mm; the field name carries the unit.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::{round_to, ParseAnomaly, RecordDecoder};
use crate::event::{EventPayload, SensorReading};

/// Identity and framing keys, never treated as measurements
const NON_MEASUREMENT_KEYS: [&str; 7] = ["time", "model", "id", "channel", "mic", "mod", "protocol"];

pub struct SensorDecoder;

impl RecordDecoder for SensorDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<EventPayload>) -> Result<(), ParseAnomaly> {
        let line = line.trim();
        let record = if line.starts_with('{') {
            serde_json::from_str::<Map<String, Value>>(line)
                .map_err(|e| ParseAnomaly::new(format!("invalid sensor JSON: {}", e)))?
        } else if line.contains('=') {
            parse_key_values(line)?
        } else {
            return Ok(());
        };

        out.push(EventPayload::SensorReading(build_reading(record)?));
        Ok(())
    }
}

fn parse_key_values(line: &str) -> Result<Map<String, Value>, ParseAnomaly> {
    let mut map = Map::new();
    let mut rest = line.trim_start();

    while !rest.is_empty() {
        let eq = rest
            .find('=')
            .ok_or_else(|| ParseAnomaly::new(format!("token without '=' in {:?}", rest)))?;
        let key = &rest[..eq];
        if key.is_empty() || key.contains(char::is_whitespace) {
            return Err(ParseAnomaly::new(format!("bad key {:?}", key)));
        }
        rest = &rest[eq + 1..];

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let end = quoted
                .find('"')
                .ok_or_else(|| ParseAnomaly::new("unterminated quoted value"))?;
            rest = &quoted[end + 1..];
            Value::String(quoted[..end].to_string())
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let raw = &rest[..end];
            rest = &rest[end..];
            if let Ok(n) = raw.parse::<i64>() {
                Value::from(n)
            } else {
                raw.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or_else(|| Value::String(raw.to_string()))
            }
        };

        map.insert(key.to_string(), value);
        rest = rest.trim_start();
    }

    Ok(map)
}

fn build_reading(record: Map<String, Value>) -> Result<SensorReading, ParseAnomaly> {
    let model = match record.get("model") {
        Some(Value::String(m)) if !m.is_empty() => m.clone(),
        _ => return Err(ParseAnomaly::new("sensor record without model")),
    };

    let mut fields = BTreeMap::new();
    for (key, value) in &record {
        if NON_MEASUREMENT_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(n) = value.as_f64() {
            let (name, canonical) = canonicalize(key, n);
            fields.insert(name, canonical);
        }
    }

    Ok(SensorReading {
        model,
        id: record.get("id").and_then(identity_string),
        channel: record.get("channel").and_then(identity_string),
        fields,
    })
}

fn identity_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert a unit-suffixed field to its canonical unit and name
fn canonicalize(key: &str, value: f64) -> (String, f64) {
    let converted = |stem: &str, suffix: &str, v: f64| (format!("{}{}", stem, suffix), round_to(v, 2));

    if key.starts_with("temperature") {
        if let Some(stem) = key.strip_suffix("_F") {
            return converted(stem, "_C", (value - 32.0) * 5.0 / 9.0);
        }
    }
    if let Some(stem) = key.strip_suffix("_kPa") {
        return converted(stem, "_hPa", value * 10.0);
    }
    if let Some(stem) = key.strip_suffix("_inHg") {
        return converted(stem, "_hPa", value * 33.8639);
    }
    if let Some(stem) = key.strip_suffix("_PSI") {
        return converted(stem, "_hPa", value * 68.9476);
    }
    if let Some(stem) = key.strip_suffix("_km_h") {
        return converted(stem, "_m_s", value / 3.6);
    }
    if let Some(stem) = key.strip_suffix("_mi_h") {
        return converted(stem, "_m_s", value * 0.44704);
    }
    if key.starts_with("rain") {
        if let Some(stem) = key.strip_suffix("_in") {
            return converted(stem, "_mm", value * 25.4);
        }
    }
    (key.to_string(), value)
}
