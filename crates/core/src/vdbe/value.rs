//! Tagged values for the VDBE stack and memory cells.

use std::cmp::Ordering;
use std::fmt;

/// Strings up to this many bytes are stored inline in the cell.
pub const INLINE_LEN: usize = 22;

/// Text payload of a value cell. Short strings live in the cell itself;
/// longer ones own a heap allocation. The variant answers the ownership
/// question the original tracked with a flag.
#[derive(Clone)]
pub enum Text {
    Inline { len: u8, buf: [u8; INLINE_LEN] },
    Heap(String),
}

impl Text {
    pub fn new(s: &str) -> Text {
        if s.len() <= INLINE_LEN {
            let mut buf = [0u8; INLINE_LEN];
            buf[..s.len()].copy_from_slice(s.as_bytes());
            Text::Inline {
                len: s.len() as u8,
                buf,
            }
        } else {
            Text::Heap(s.to_owned())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Text::Inline { len, buf } => {
                std::str::from_utf8(&buf[..*len as usize]).unwrap_or_default()
            }
            Text::Heap(s) => s,
        }
    }
}

impl From<String> for Text {
    fn from(s: String) -> Text {
        if s.len() <= INLINE_LEN {
            Text::new(&s)
        } else {
            Text::Heap(s)
        }
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Real(f64),
    Text(Text),
    Blob(Vec<u8>),
}

impl Value {
    pub fn from_text(s: &str) -> Value {
        Value::Text(Text::new(s))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric interpretation, if the value is a number or numeric text.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            Value::Text(t) => parse_number(t.as_str()),
            _ => None,
        }
    }

    /// Integer interpretation with text coercion; `None` when the value
    /// cannot be read as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Real(r) => Some(*r as i64),
            Value::Text(t) => {
                let s = t.as_str().trim();
                s.parse::<i64>().ok().or_else(|| {
                    parse_number(s).map(|f| f as i64)
                })
            }
            _ => None,
        }
    }

    /// Truthiness for IF-style jumps: NULL and non-numeric text are false.
    pub fn is_true(&self) -> bool {
        self.as_number().is_some_and(|n| n != 0.0)
    }

    /// Render the value the way result rows and concatenation see it.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Real(r) => format_real(*r),
            Value::Text(t) => t.as_str().to_owned(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Whether the value is numeric or looks like a number. Numeric values
    /// sort before non-numeric ones.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Real(_))
            || matches!(self, Value::Text(t) if parse_number(t.as_str()).is_some())
    }

    /// Engine ordering: NULL < numbers < text/blobs; numbers compare
    /// numerically, everything else by bytes.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        match (self.is_numeric(), other.is_numeric()) {
            (true, true) => {
                let a = self.as_number().expect("numeric");
                let b = other.as_number().expect("numeric");
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.to_text().cmp(&other.to_text()),
        }
    }

    /// SQL equality used by comparison opcodes; NULL operands yield
    /// `None` (the unknown truth value).
    pub fn sql_compare(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        Some(self.compare(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok()
}

/// Real numbers print without a trailing `.0` only when they have a
/// fractional part; integral reals keep one decimal place so the text
/// form stays recognisably real.
fn format_real(r: f64) -> String {
    if r == r.trunc() && r.abs() < 1e15 {
        format!("{r:.1}")
    } else {
        format!("{r}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_stay_inline() {
        let text = Text::new("hello");
        assert!(matches!(text, Text::Inline { len: 5, .. }));
        assert_eq!(text.as_str(), "hello");

        let long = "x".repeat(INLINE_LEN + 1);
        assert!(matches!(Text::new(&long), Text::Heap(_)));
    }

    #[test]
    fn numbers_sort_before_text() {
        let n = Value::Int(99);
        let t = Value::from_text("1abc");
        assert_eq!(n.compare(&t), Ordering::Less);
        assert_eq!(t.compare(&n), Ordering::Greater);
    }

    #[test]
    fn numeric_text_compares_numerically() {
        let a = Value::from_text("10");
        let b = Value::Int(9);
        assert_eq!(a.compare(&b), Ordering::Greater);
    }

    #[test]
    fn null_comparisons_are_unknown() {
        assert_eq!(Value::Null.sql_compare(&Value::Int(1)), None);
        assert_eq!(Value::Null.compare(&Value::Null), Ordering::Equal);
    }

    #[test]
    fn truthiness() {
        assert!(Value::Int(1).is_true());
        assert!(!Value::Int(0).is_true());
        assert!(!Value::Null.is_true());
        assert!(Value::from_text("2").is_true());
        assert!(!Value::from_text("x").is_true());
    }

    #[test]
    fn real_text_form() {
        assert_eq!(Value::Real(2.0).to_text(), "2.0");
        assert_eq!(Value::Real(2.5).to_text(), "2.5");
    }
}
