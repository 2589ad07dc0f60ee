//! Packed row format: a column count, a type/length directory, then the
//! payloads. Rows are decoded column-at-a-time; the directory makes that a
//! single scan without materialising the whole row.

use crate::vdbe::value::Value;

const TYPE_NULL: u8 = 0;
const TYPE_INT: u8 = 1;
const TYPE_REAL: u8 = 2;
const TYPE_TEXT: u8 = 3;
const TYPE_BLOB: u8 = 4;

pub fn encode_record(values: &[Value]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + values.len() * 5);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    let mut payload: Vec<u8> = Vec::new();
    for value in values {
        let (tag, bytes): (u8, Vec<u8>) = match value {
            Value::Null => (TYPE_NULL, Vec::new()),
            Value::Int(i) => (TYPE_INT, i.to_be_bytes().to_vec()),
            Value::Real(r) => (TYPE_REAL, r.to_be_bytes().to_vec()),
            Value::Text(t) => (TYPE_TEXT, t.as_str().as_bytes().to_vec()),
            Value::Blob(b) => (TYPE_BLOB, b.clone()),
        };
        out.push(tag);
        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        payload.extend_from_slice(&bytes);
    }
    out.extend_from_slice(&payload);
    out
}

pub fn column_count(record: &[u8]) -> usize {
    if record.len() < 4 {
        return 0;
    }
    u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize
}

/// Decode column `idx`; columns past the end of the record read as NULL,
/// which is how rows written before an implicit schema change widen.
pub fn decode_column(record: &[u8], idx: usize) -> Value {
    let n = column_count(record);
    if idx >= n {
        return Value::Null;
    }
    let dir_start = 4;
    let payload_start = dir_start + n * 5;
    let mut offset = payload_start;
    for i in 0..=idx {
        let entry = dir_start + i * 5;
        if entry + 5 > record.len() {
            return Value::Null;
        }
        let tag = record[entry];
        let len = u32::from_le_bytes([
            record[entry + 1],
            record[entry + 2],
            record[entry + 3],
            record[entry + 4],
        ]) as usize;
        if i == idx {
            let end = (offset + len).min(record.len());
            let bytes = &record[offset..end];
            return match tag {
                TYPE_INT if bytes.len() == 8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(bytes);
                    Value::Int(i64::from_be_bytes(buf))
                }
                TYPE_REAL if bytes.len() == 8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(bytes);
                    Value::Real(f64::from_be_bytes(buf))
                }
                TYPE_TEXT => Value::from_text(&String::from_utf8_lossy(bytes)),
                TYPE_BLOB => Value::Blob(bytes.to_vec()),
                _ => Value::Null,
            };
        }
        offset += len;
    }
    Value::Null
}

pub fn decode_record(record: &[u8]) -> Vec<Value> {
    (0..column_count(record))
        .map(|i| decode_column(record, i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_row() {
        let row = vec![
            Value::Null,
            Value::Int(-9),
            Value::Real(1.5),
            Value::from_text("hello world"),
            Value::Blob(vec![0, 1, 2]),
        ];
        let record = encode_record(&row);
        assert_eq!(column_count(&record), 5);
        let back = decode_record(&record);
        assert!(back[0].is_null());
        assert!(matches!(back[1], Value::Int(-9)));
        assert!(matches!(back[2], Value::Real(r) if r == 1.5));
        assert_eq!(back[3].to_text(), "hello world");
        assert!(matches!(&back[4], Value::Blob(b) if b == &[0, 1, 2]));
    }

    #[test]
    fn reads_past_end_as_null() {
        let record = encode_record(&[Value::Int(1)]);
        assert!(decode_column(&record, 5).is_null());
    }
}
