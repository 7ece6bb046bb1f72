use hex::ToHex;
use sha2::Digest;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_sha256_hex(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 64 {
        return false;
    }
    bytes.iter().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Crash ids are hyphenated UUID-shaped strings whose last six characters
/// encode the submission date (YYMMDD). Anything else never reaches storage.
pub fn is_crash_id(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }

    for (idx, b) in bytes.iter().enumerate() {
        match idx {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            30.. => {
                if !b.is_ascii_digit() {
                    return false;
                }
            }
            _ => {
                if !matches!(b, b'0'..=b'9' | b'a'..=b'f') {
                    return false;
                }
            }
        }
    }

    true
}

pub fn canonicalize_json_value(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Null => serde_json::Value::Null,
        serde_json::Value::Bool(v) => serde_json::Value::Bool(*v),
        serde_json::Value::Number(v) => serde_json::Value::Number(v.clone()),
        serde_json::Value::String(v) => serde_json::Value::String(v.clone()),
        serde_json::Value::Array(values) => serde_json::Value::Array(
            values
                .iter()
                .map(canonicalize_json_value)
                .collect::<Vec<_>>(),
        ),
        serde_json::Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in entries {
                out.insert(k.clone(), canonicalize_json_value(v));
            }
            serde_json::Value::Object(out)
        }
    }
}

pub fn canonical_json_bytes(value: &serde_json::Value) -> Vec<u8> {
    let canonical = canonicalize_json_value(value);
    serde_json::to_vec(&canonical).unwrap_or_else(|_| b"null".to_vec())
}

pub fn canonical_json_string(value: &serde_json::Value) -> String {
    String::from_utf8(canonical_json_bytes(value)).unwrap_or_else(|_| "null".to_string())
}

pub fn hash_canonical_json(value: &serde_json::Value) -> String {
    sha256_hex(&canonical_json_bytes(value))
}
