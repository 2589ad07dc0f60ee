//! Composite-key encoding. Every column value is prefixed by a one-byte
//! sort tag: `+`/`-` for ascending/descending numerics, `A`/`D` for
//! ascending/descending text, `N` for NULL. Payloads are encoded so that
//! untyped byte comparison on the storage side equals the engine's logical
//! ordering: numerics before text, NULL last, direction applied within the
//! class.

use std::sync::Arc;

use crate::ast::SortOrder;
use crate::vdbe::value::Value;

pub const TAG_NUM_ASC: u8 = b'+';
pub const TAG_NUM_DESC: u8 = b'-';
pub const TAG_TEXT_ASC: u8 = b'A';
pub const TAG_TEXT_DESC: u8 = b'D';
pub const TAG_NULL: u8 = b'N';

/// Per-column sort directions for a key template.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    pub sort: Vec<SortOrder>,
}

impl KeyLayout {
    pub fn ascending(n: usize) -> Arc<KeyLayout> {
        Arc::new(KeyLayout {
            sort: vec![SortOrder::Asc; n],
        })
    }

    pub fn of(sort: Vec<SortOrder>) -> Arc<KeyLayout> {
        Arc::new(KeyLayout { sort })
    }
}

/// Order-preserving big-endian image of an f64.
fn f64_sortable(v: f64) -> [u8; 8] {
    let bits = v.to_bits();
    let flipped = if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    };
    flipped.to_be_bytes()
}

fn f64_unsortable(bytes: [u8; 8]) -> f64 {
    let flipped = u64::from_be_bytes(bytes);
    let bits = if flipped & (1 << 63) != 0 {
        flipped & !(1 << 63)
    } else {
        !flipped
    };
    f64::from_bits(bits)
}

/// Order-preserving image of a signed row id (no tag byte; row ids keep
/// exact 64-bit precision).
pub fn encode_rowid(rowid: i64) -> [u8; 8] {
    ((rowid as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_rowid(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    (u64::from_be_bytes(buf) ^ (1 << 63)) as i64
}

fn push_column(out: &mut Vec<u8>, value: &Value, order: SortOrder) {
    if value.is_null() {
        out.push(TAG_NULL);
        return;
    }
    if value.is_numeric() {
        let n = value.as_number().expect("numeric");
        let image = f64_sortable(n);
        match order {
            SortOrder::Asc => {
                out.push(TAG_NUM_ASC);
                out.extend_from_slice(&image);
            }
            SortOrder::Desc => {
                out.push(TAG_NUM_DESC);
                out.extend(image.iter().map(|b| !b));
            }
        }
        return;
    }
    // Blobs keep their raw bytes; everything else goes through its text
    // form.
    let owned;
    let bytes: &[u8] = match value {
        Value::Blob(b) => b,
        other => {
            owned = other.to_text();
            owned.as_bytes()
        }
    };
    match order {
        SortOrder::Asc => {
            out.push(TAG_TEXT_ASC);
            out.extend_from_slice(bytes);
            out.push(0x00);
        }
        SortOrder::Desc => {
            out.push(TAG_TEXT_DESC);
            out.extend(bytes.iter().map(|b| !b));
            out.push(0xFF);
        }
    }
}

/// Encode `values` as one composite key following `layout` (missing
/// directions default to ascending).
pub fn encode_key(values: &[Value], layout: &KeyLayout) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 10);
    for (i, value) in values.iter().enumerate() {
        let order = layout.sort.get(i).copied().unwrap_or(SortOrder::Asc);
        push_column(&mut out, value, order);
    }
    out
}

/// Decode a key built by [`encode_key`] back into values. Descending
/// numerics decode exactly; descending text decodes by re-inverting.
pub fn decode_key(bytes: &[u8]) -> Vec<Value> {
    let mut values = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let tag = bytes[i];
        i += 1;
        match tag {
            TAG_NULL => values.push(Value::Null),
            TAG_NUM_ASC | TAG_NUM_DESC => {
                if i + 8 > bytes.len() {
                    break;
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes[i..i + 8]);
                if tag == TAG_NUM_DESC {
                    for b in &mut buf {
                        *b = !*b;
                    }
                }
                let n = f64_unsortable(buf);
                values.push(if n == n.trunc() && n.abs() < 9.22e18 {
                    Value::Int(n as i64)
                } else {
                    Value::Real(n)
                });
                i += 8;
            }
            TAG_TEXT_ASC => {
                let end = bytes[i..]
                    .iter()
                    .position(|&b| b == 0x00)
                    .map_or(bytes.len(), |p| i + p);
                values.push(Value::from_text(&String::from_utf8_lossy(&bytes[i..end])));
                i = end + 1;
            }
            TAG_TEXT_DESC => {
                let end = bytes[i..]
                    .iter()
                    .position(|&b| b == 0xFF)
                    .map_or(bytes.len(), |p| i + p);
                let raw: Vec<u8> = bytes[i..end].iter().map(|b| !b).collect();
                values.push(Value::from_text(&String::from_utf8_lossy(&raw)));
                i = end + 1;
            }
            _ => break,
        }
    }
    values
}

/// Append the row-id suffix that makes non-unique index keys distinct.
pub fn append_rowid(key: &mut Vec<u8>, rowid: i64) {
    key.extend_from_slice(&encode_rowid(rowid));
}

/// Split an index key into its column prefix and trailing row id.
pub fn split_rowid(key: &[u8]) -> (&[u8], i64) {
    let at = key.len().saturating_sub(8);
    (&key[..at], decode_rowid(&key[at..]))
}

/// Smallest key strictly greater than every key with this prefix.
pub fn increment(key: &mut Vec<u8>) {
    while let Some(last) = key.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return;
        }
        key.pop();
    }
    // All bytes were 0xFF; an empty key after increment means "past the
    // end", which callers treat as an open bound.
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    /// The logical order the byte encoding must reproduce: class rank
    /// (numeric, text, NULL) then the column direction within the class.
    fn logical_cmp(a: &Value, b: &Value, order: SortOrder) -> Ordering {
        fn class(v: &Value) -> u8 {
            if v.is_null() {
                2
            } else if v.is_numeric() {
                0
            } else {
                1
            }
        }
        let by_class = class(a).cmp(&class(b));
        if by_class != Ordering::Equal || a.is_null() {
            return by_class;
        }
        let within = a.compare(b);
        match order {
            SortOrder::Asc => within,
            SortOrder::Desc => within.reverse(),
        }
    }

    fn samples() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Int(-40),
            Value::Int(0),
            Value::Int(7),
            Value::Int(7_000_000),
            Value::Real(-0.5),
            Value::Real(3.25),
            Value::from_text("10"),
            Value::from_text(""),
            Value::from_text("abc"),
            Value::from_text("abd"),
            Value::from_text("ab"),
        ]
    }

    #[test]
    fn byte_order_matches_logical_order() {
        for order in [SortOrder::Asc, SortOrder::Desc] {
            let layout = KeyLayout::of(vec![order]);
            for a in samples() {
                for b in samples() {
                    let ka = encode_key(std::slice::from_ref(&a), &layout);
                    let kb = encode_key(std::slice::from_ref(&b), &layout);
                    assert_eq!(
                        ka.cmp(&kb),
                        logical_cmp(&a, &b, order),
                        "{a:?} vs {b:?} ({order:?})"
                    );
                }
            }
        }
    }

    #[test]
    fn composite_keys_compare_by_column() {
        let layout = KeyLayout::ascending(2);
        let k1 = encode_key(&[Value::Int(1), Value::from_text("z")], &layout);
        let k2 = encode_key(&[Value::Int(2), Value::from_text("a")], &layout);
        assert!(k1 < k2);
    }

    #[test]
    fn rowid_encoding_is_monotonic() {
        let ids = [i64::MIN, -5, -1, 0, 1, 42, i64::MAX];
        for window in ids.windows(2) {
            assert!(encode_rowid(window[0]) < encode_rowid(window[1]));
        }
        assert_eq!(decode_rowid(&encode_rowid(-12345)), -12345);
    }

    #[test]
    fn key_round_trip() {
        let layout = KeyLayout::ascending(3);
        let values = vec![Value::Int(12), Value::Null, Value::from_text("hi")];
        let decoded = decode_key(&encode_key(&values, &layout));
        assert_eq!(decoded.len(), 3);
        assert!(matches!(decoded[0], Value::Int(12)));
        assert!(decoded[1].is_null());
        assert_eq!(decoded[2].to_text(), "hi");
    }

    #[test]
    fn increment_produces_exclusive_bound() {
        let layout = KeyLayout::ascending(1);
        let mut bound = encode_key(&[Value::Int(5)], &layout);
        let five_z = {
            let mut k = encode_key(&[Value::Int(5)], &layout);
            append_rowid(&mut k, 99);
            k
        };
        increment(&mut bound);
        assert!(five_z < bound);
        let six = encode_key(&[Value::Int(6)], &layout);
        assert!(bound <= six);
    }

    #[test]
    fn split_rowid_recovers_suffix() {
        let layout = KeyLayout::ascending(1);
        let mut key = encode_key(&[Value::from_text("k")], &layout);
        let prefix_len = key.len();
        append_rowid(&mut key, 77);
        let (prefix, rowid) = split_rowid(&key);
        assert_eq!(prefix.len(), prefix_len);
        assert_eq!(rowid, 77);
    }
}
