//! JSON-Cadence values: decoding event/script payloads into plain JSON and
//! encoding typed transaction arguments.
//!
//! The access node wraps every value as `{"type": T, "value": V}`. Decoding
//! strips the wrappers so handlers can read fields by name; fixed-point
//! numbers stay strings to avoid losing precision.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Largest value representable by `UFix64`.
pub const UFIX64_MAX: f64 = 184_467_440_737.095_516_15;

/// Decimal places used for amounts and shares.
pub const UFIX64_DECIMALS: usize = 8;

/// Argument types the builder emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    String,
    UFix64,
    Address,
    UInt8,
    Array(Box<TypeTag>),
}

impl TypeTag {
    pub fn array_of(inner: TypeTag) -> Self {
        TypeTag::Array(Box::new(inner))
    }

    pub fn cadence_name(&self) -> String {
        match self {
            TypeTag::String => "String".to_string(),
            TypeTag::UFix64 => "UFix64".to_string(),
            TypeTag::Address => "Address".to_string(),
            TypeTag::UInt8 => "UInt8".to_string(),
            TypeTag::Array(inner) => format!("[{}]", inner.cadence_name()),
        }
    }
}

/// Formats a non-negative quantity with a fixed number of decimals, the way
/// the ledger's fixed-point type expects it.
pub fn format_fixed(value: f64, decimals: usize) -> Result<String> {
    if !value.is_finite() {
        bail!("value is not finite: {}", value);
    }
    if value < 0.0 {
        bail!("value must be non-negative: {}", value);
    }
    if value > UFIX64_MAX {
        bail!("value exceeds UFix64 range: {}", value);
    }
    Ok(format!("{:.*}", decimals, value))
}

pub fn format_ufix64(value: f64) -> Result<String> {
    format_fixed(value, UFIX64_DECIMALS)
}

/// `0x` followed by 16 hex digits.
pub fn is_flow_address(addr: &str) -> bool {
    addr.strip_prefix("0x")
        .map(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Strips JSON-Cadence wrappers recursively.
pub fn decode_value(v: &Value) -> Value {
    let (ty, inner) = match (v.get("type").and_then(Value::as_str), v.get("value")) {
        (Some(ty), inner) => (ty, inner),
        _ => return v.clone(),
    };
    let inner = match inner {
        Some(inner) => inner,
        None => return Value::Null,
    };

    match ty {
        "Optional" => {
            if inner.is_null() {
                Value::Null
            } else {
                decode_value(inner)
            }
        }
        "Void" => Value::Null,
        "Bool" | "String" | "Address" | "Character" | "UFix64" | "Fix64" => inner.clone(),
        "Int" | "Int8" | "Int16" | "Int32" | "Int64" | "Int128" | "Int256" | "UInt" | "UInt8"
        | "UInt16" | "UInt32" | "UInt64" | "UInt128" | "UInt256" | "Word8" | "Word16"
        | "Word32" | "Word64" => decode_integer(inner),
        "Array" => Value::Array(
            inner
                .as_array()
                .map(|items| items.iter().map(decode_value).collect())
                .unwrap_or_default(),
        ),
        "Dictionary" => {
            let mut out = Map::new();
            for entry in inner.as_array().into_iter().flatten() {
                let key = entry.get("key").map(decode_value).unwrap_or(Value::Null);
                let value = entry.get("value").map(decode_value).unwrap_or(Value::Null);
                let key = match key {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                out.insert(key, value);
            }
            Value::Object(out)
        }
        "Struct" | "Resource" | "Event" | "Contract" | "Enum" => Value::Object(decode_fields(inner)),
        "Path" => {
            let domain = inner.get("domain").and_then(Value::as_str).unwrap_or("");
            let ident = inner.get("identifier").and_then(Value::as_str).unwrap_or("");
            Value::String(format!("/{}/{}", domain, ident))
        }
        "Type" => inner
            .get("staticType")
            .and_then(|t| t.get("typeID").or(Some(t)))
            .map(|t| match t {
                Value::String(s) => Value::String(s.clone()),
                other => other.clone(),
            })
            .unwrap_or(Value::Null),
        _ => inner.clone(),
    }
}

fn decode_integer(inner: &Value) -> Value {
    match inner {
        Value::String(s) => s
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| s.parse::<u64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(s.clone())),
        other => other.clone(),
    }
}

fn decode_fields(composite: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for field in composite
        .get("fields")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        if let Some(name) = field.get("name").and_then(Value::as_str) {
            let value = field.get("value").map(decode_value).unwrap_or(Value::Null);
            out.insert(name.to_string(), value);
        }
    }
    out
}

/// Decodes a base64 JSON-Cadence document.
pub fn decode_base64(payload: &str) -> Result<Value> {
    let bytes = STANDARD
        .decode(payload.trim())
        .context("payload is not valid base64")?;
    let doc: Value = serde_json::from_slice(&bytes).context("payload is not JSON-Cadence")?;
    Ok(decode_value(&doc))
}

/// Decodes an event payload into its field map.
pub fn decode_event_payload(payload: &str) -> Result<Map<String, Value>> {
    match decode_base64(payload)? {
        Value::Object(fields) => Ok(fields),
        other => Err(anyhow!("event payload is not a composite: {}", other)),
    }
}

/// Wraps a plain value as JSON-Cadence for the given type.
pub fn encode_arg(value: &Value, tag: &TypeTag) -> Result<Value> {
    match tag {
        TypeTag::String | TypeTag::Address | TypeTag::UFix64 => {
            let s = value
                .as_str()
                .ok_or_else(|| anyhow!("{} argument must be a string, got {}", tag.cadence_name(), value))?;
            Ok(json!({ "type": tag.cadence_name(), "value": s }))
        }
        TypeTag::UInt8 => {
            let n = match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.parse::<u64>().ok(),
                _ => None,
            }
            .filter(|n| *n <= u8::MAX as u64)
            .ok_or_else(|| anyhow!("UInt8 argument out of range: {}", value))?;
            Ok(json!({ "type": "UInt8", "value": n.to_string() }))
        }
        TypeTag::Array(inner) => {
            let items = value
                .as_array()
                .ok_or_else(|| anyhow!("array argument must be a list, got {}", value))?;
            let encoded = items
                .iter()
                .map(|item| encode_arg(item, inner))
                .collect::<Result<Vec<_>>>()?;
            Ok(json!({ "type": "Array", "value": encoded }))
        }
    }
}

pub fn encode_base64(value: &Value) -> String {
    STANDARD.encode(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_fixed() {
        assert_eq!(format_ufix64(50.0).unwrap(), "50.00000000");
        assert_eq!(format_ufix64(0.1).unwrap(), "0.10000000");
        assert_eq!(format_fixed(87.5, 2).unwrap(), "87.50");
        assert!(format_ufix64(-1.0).is_err());
        assert!(format_ufix64(f64::NAN).is_err());
        assert!(format_ufix64(1e12).is_err());
    }

    #[test]
    fn test_flow_address_format() {
        assert!(is_flow_address("0xf8d6e0586b0a20c7"));
        assert!(!is_flow_address("f8d6e0586b0a20c7"));
        assert!(!is_flow_address("0xf8d6"));
        assert!(!is_flow_address("0xzzd6e0586b0a20c7"));
    }

    #[test]
    fn test_decode_event_fields() {
        let doc = json!({
            "type": "Event",
            "value": {
                "id": "A.f8d6e0586b0a20c7.AIONVault.Deposit",
                "fields": [
                    { "name": "user", "value": { "type": "Address", "value": "0x01cf0e2f2f715450" } },
                    { "name": "amount", "value": { "type": "UFix64", "value": "10.00000000" } },
                    { "name": "count", "value": { "type": "UInt64", "value": "7" } },
                    { "name": "note", "value": { "type": "Optional", "value": null } },
                    { "name": "tags", "value": { "type": "Array", "value": [
                        { "type": "String", "value": "a" },
                        { "type": "String", "value": "b" }
                    ] } }
                ]
            }
        });
        let fields = decode_event_payload(&encode_base64(&doc)).unwrap();
        assert_eq!(fields["user"], json!("0x01cf0e2f2f715450"));
        assert_eq!(fields["amount"], json!("10.00000000"));
        assert_eq!(fields["count"], json!(7));
        assert_eq!(fields["note"], Value::Null);
        assert_eq!(fields["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_decode_dictionary() {
        let doc = json!({
            "type": "Dictionary",
            "value": [
                { "key": { "type": "String", "value": "totalAssets" },
                  "value": { "type": "UFix64", "value": "100.00000000" } }
            ]
        });
        assert_eq!(decode_value(&doc), json!({ "totalAssets": "100.00000000" }));
    }

    #[test]
    fn test_encode_nested_array() {
        let v = encode_arg(&json!(["1.00", "2.50"]), &TypeTag::array_of(TypeTag::UFix64)).unwrap();
        assert_eq!(
            v,
            json!({ "type": "Array", "value": [
                { "type": "UFix64", "value": "1.00" },
                { "type": "UFix64", "value": "2.50" }
            ] })
        );
        assert!(encode_arg(&json!(300), &TypeTag::UInt8).is_err());
        assert_eq!(encode_arg(&json!(3), &TypeTag::UInt8).unwrap()["value"], json!("3"));
    }

    #[test]
    fn test_rejects_garbage_payload() {
        assert!(decode_event_payload("!!!").is_err());
        assert!(decode_event_payload(&encode_base64(&json!({"type": "String", "value": "x"}))).is_err());
    }
}
