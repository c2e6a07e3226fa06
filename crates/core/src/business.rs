use sha2::{Digest, Sha256};

use crate::domain::record::ChangeSet;

/// Stable hash identifying "this rule already handled this change". The
/// change set is serialized in field order with both sides of each change so
/// the same logical transition always produces the same key.
pub fn business_key(rule_id: &str, table_id: &str, record_id: &str, changes: &ChangeSet) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(table_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(record_id.as_bytes());
    for change in &changes.changes {
        hasher.update(b"\x1e");
        hasher.update(change.field.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(encode_side(&change.old));
        hasher.update(b"\x1f");
        hasher.update(encode_side(&change.new));
    }
    let digest = hasher.finalize();
    format!("{}:{}:{}", table_id, record_id, hex(&digest))
}

fn encode_side(value: &Option<crate::domain::record::FieldValue>) -> Vec<u8> {
    match value {
        Some(value) => serde_json::to_vec(value).unwrap_or_default(),
        None => b"<absent>".to_vec(),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
