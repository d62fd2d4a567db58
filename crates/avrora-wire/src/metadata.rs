//! Per-call metadata: an Avro `map<bytes>` carrying the correlation id.

use avrora_schema::{cursor, Cursor};

use crate::WireError;

/// Map key holding the correlation id of a call.
pub const CALL_ID_KEY: &str = "avro.id";

/// The metadata blob exchanged with every call and reply.
///
/// Only [`CALL_ID_KEY`] is interpreted; other entries are carried
/// transparently so peers can attach their own keys.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMetadata {
    pub id: i64,
    pub extra: Vec<(String, Vec<u8>)>,
}

impl CallMetadata {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            extra: Vec::new(),
        }
    }

    /// Encodes the metadata map. The id entry is written first, as a
    /// zig-zag varint value.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut id_bytes = Vec::with_capacity(10);
        cursor::write_long(&mut id_bytes, self.id);
        let mut entries: Vec<(&str, &[u8])> = Vec::with_capacity(1 + self.extra.len());
        entries.push((CALL_ID_KEY, &id_bytes));
        for (k, v) in &self.extra {
            entries.push((k, v));
        }
        write_meta_entries(buf, &entries);
    }

    /// Decodes the metadata map, requiring the id entry.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self, WireError> {
        let entries = read_meta(cur).map_err(|e| WireError::InvalidMetadata(e.to_string()))?;
        let mut id = None;
        let mut extra = Vec::new();
        for (key, value) in entries {
            if key == CALL_ID_KEY {
                let mut inner = Cursor::new(&value);
                id = Some(
                    inner
                        .read_long()
                        .map_err(|e| WireError::InvalidMetadata(e.to_string()))?,
                );
            } else {
                extra.push((key, value));
            }
        }
        let id = id.ok_or_else(|| {
            WireError::InvalidMetadata(format!("missing {CALL_ID_KEY:?} entry"))
        })?;
        Ok(Self { id, extra })
    }
}

/// Writes a `map<bytes>` as a single block.
pub fn write_meta(buf: &mut Vec<u8>, entries: &[(String, Vec<u8>)]) {
    let borrowed: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_slice()))
        .collect();
    write_meta_entries(buf, &borrowed);
}

fn write_meta_entries(buf: &mut Vec<u8>, entries: &[(&str, &[u8])]) {
    if !entries.is_empty() {
        cursor::write_long(buf, entries.len() as i64);
        for (key, value) in entries {
            cursor::write_string(buf, key);
            cursor::write_bytes(buf, value);
        }
    }
    cursor::write_long(buf, 0);
}

/// Reads a `map<bytes>`, accepting multi-block encodings.
pub fn read_meta(cur: &mut Cursor<'_>) -> Result<Vec<(String, Vec<u8>)>, avrora_schema::SchemaError> {
    let mut out = Vec::new();
    loop {
        let mut count = cur.read_long()?;
        if count == 0 {
            return Ok(out);
        }
        if count < 0 {
            cur.read_long()?;
            count = -count;
        }
        for _ in 0..count {
            let key = cur.read_string()?;
            let value = cur.read_bytes()?.to_vec();
            out.push((key, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrip() {
        for id in [1i64, 2, 1000, i64::MAX] {
            let mut buf = Vec::new();
            CallMetadata::new(id).encode(&mut buf);
            let mut cur = Cursor::new(&buf);
            let meta = CallMetadata::decode(&mut cur).unwrap();
            assert_eq!(meta.id, id);
            assert!(meta.extra.is_empty());
            assert!(cur.is_empty());
        }
    }

    #[test]
    fn extra_keys_are_carried() {
        let mut meta = CallMetadata::new(7);
        meta.extra.push(("trace".to_string(), vec![1, 2, 3]));
        let mut buf = Vec::new();
        meta.encode(&mut buf);
        let mut cur = Cursor::new(&buf);
        let decoded = CallMetadata::decode(&mut cur).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn missing_id_is_invalid() {
        let mut buf = Vec::new();
        write_meta(&mut buf, &[("other".to_string(), vec![0])]);
        let mut cur = Cursor::new(&buf);
        assert!(matches!(
            CallMetadata::decode(&mut cur),
            Err(WireError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn garbage_is_invalid() {
        // A huge positive map count with no entries behind it.
        let mut cur = Cursor::new(&[0xFE, 0xFF, 0xFF, 0x0F]);
        assert!(CallMetadata::decode(&mut cur).is_err());
    }
}
