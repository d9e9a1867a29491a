use hex::ToHex;
use serde_json::Value;
use sha2::Digest;
use unicode_normalization::UnicodeNormalization;

pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

pub fn is_content_digest(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Normalizes source text before it is handed to generation: unified line
/// endings, NFC composition, and no trailing whitespace on the whole text.
pub fn normalize_source_text(input: &str) -> String {
    let unified = input.replace("\r\n", "\n").replace('\r', "\n");
    let composed = unified.nfc().collect::<String>();
    composed.trim_end().to_string()
}

fn sort_object_keys(value: &Value) -> Value {
    match value {
        Value::Array(values) => Value::Array(values.iter().map(sort_object_keys).collect()),
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();

            let mut out = serde_json::Map::with_capacity(map.len());
            for key in keys {
                if let Some(inner) = map.get(key) {
                    out.insert(key.clone(), sort_object_keys(inner));
                }
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

pub fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    serde_json::to_vec(&sort_object_keys(value)).unwrap_or_else(|_| b"null".to_vec())
}

pub fn hash_canonical_json(value: &Value) -> String {
    content_digest(&canonical_json_bytes(value))
}
