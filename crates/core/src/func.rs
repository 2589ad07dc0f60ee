//! SQL function registry. Functions are keyed by lowercased name and
//! arity; an arity of -1 matches any argument count, with exact-arity
//! entries preferred. Aggregates carry a step and a finalize callback and
//! keep opaque per-group state.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;

use ahash::AHashMap;
use smol_str::SmolStr;

use crate::errors::{Error, Result};
use crate::vdbe::value::Value;

/// Per-call context handed to scalar functions.
pub struct FuncContext {
    pub last_rowid: i64,
}

/// Per-group aggregate context. `state` is sized and typed on first use
/// by the aggregate's own step function.
#[derive(Default)]
pub struct AggCtx {
    pub state: Option<Box<dyn Any>>,
    pub count: u64,
}

pub type ScalarFn = Arc<dyn Fn(&mut FuncContext, &[Value]) -> Result<Value>>;
pub type AggStepFn = Arc<dyn Fn(&mut AggCtx, &[Value]) -> Result<()>>;
pub type AggFinalFn = Arc<dyn Fn(&mut AggCtx) -> Result<Value>>;

pub enum FuncKind {
    Scalar(ScalarFn),
    Aggregate {
        step: AggStepFn,
        finalize: AggFinalFn,
    },
}

pub struct FuncDef {
    pub name: SmolStr,
    pub arity: i32,
    pub kind: FuncKind,
}

impl std::fmt::Debug for FuncDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FuncDef({}/{})", self.name, self.arity)
    }
}

impl FuncDef {
    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, FuncKind::Aggregate { .. })
    }
}

pub struct FuncRegistry {
    map: AHashMap<(SmolStr, i32), Arc<FuncDef>>,
}

impl FuncRegistry {
    pub fn with_builtins() -> FuncRegistry {
        let mut registry = FuncRegistry {
            map: AHashMap::new(),
        };
        register_builtins(&mut registry);
        registry
    }

    /// Install or replace a function.
    pub fn register(&mut self, def: FuncDef) {
        let key = (SmolStr::new(def.name.to_lowercase()), def.arity);
        self.map.insert(key, Arc::new(def));
    }

    /// Exact-arity match first, then the any-arity entry.
    pub fn find(&self, name: &str, argc: i32) -> Option<Arc<FuncDef>> {
        let lower = SmolStr::new(name.to_lowercase());
        self.map
            .get(&(lower.clone(), argc))
            .or_else(|| self.map.get(&(lower, -1)))
            .cloned()
    }
}

fn scalar(
    registry: &mut FuncRegistry,
    name: &'static str,
    arity: i32,
    f: impl Fn(&mut FuncContext, &[Value]) -> Result<Value> + 'static,
) {
    registry.register(FuncDef {
        name: SmolStr::new_static(name),
        arity,
        kind: FuncKind::Scalar(Arc::new(f)),
    });
}

fn aggregate(
    registry: &mut FuncRegistry,
    name: &'static str,
    arity: i32,
    step: impl Fn(&mut AggCtx, &[Value]) -> Result<()> + 'static,
    finalize: impl Fn(&mut AggCtx) -> Result<Value> + 'static,
) {
    registry.register(FuncDef {
        name: SmolStr::new_static(name),
        arity,
        kind: FuncKind::Aggregate {
            step: Arc::new(step),
            finalize: Arc::new(finalize),
        },
    });
}

fn register_builtins(r: &mut FuncRegistry) {
    scalar(r, "min", -1, |_, args| Ok(extreme(args, Ordering::Less)));
    scalar(r, "max", -1, |_, args| Ok(extreme(args, Ordering::Greater)));
    scalar(r, "length", 1, |_, args| {
        Ok(match &args[0] {
            Value::Null => Value::Null,
            Value::Blob(b) => Value::Int(b.len() as i64),
            v => Value::Int(v.to_text().chars().count() as i64),
        })
    });
    scalar(r, "substr", 3, |_, args| Ok(substr(args)));
    scalar(r, "abs", 1, |_, args| {
        Ok(match &args[0] {
            Value::Null => Value::Null,
            Value::Int(i) => Value::Int(i.wrapping_abs()),
            v => match v.as_number() {
                Some(n) => Value::Real(n.abs()),
                None => Value::Null,
            },
        })
    });
    scalar(r, "round", 1, |_, args| Ok(round(&args[0], 0)));
    scalar(r, "round", 2, |_, args| {
        let digits = args[1].as_int().unwrap_or(0).clamp(0, 30);
        Ok(round(&args[0], digits as u32))
    });
    scalar(r, "upper", 1, |_, args| {
        Ok(match &args[0] {
            Value::Null => Value::Null,
            v => Value::from_text(&v.to_text().to_uppercase()),
        })
    });
    scalar(r, "lower", 1, |_, args| {
        Ok(match &args[0] {
            Value::Null => Value::Null,
            v => Value::from_text(&v.to_text().to_lowercase()),
        })
    });
    scalar(r, "coalesce", -1, |_, args| {
        Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null))
    });
    scalar(r, "ifnull", 2, |_, args| {
        Ok(if args[0].is_null() {
            args[1].clone()
        } else {
            args[0].clone()
        })
    });
    scalar(r, "random", 0, |_, _| Ok(Value::Int(rand::random::<i64>())));
    scalar(r, "like", 2, |_, args| {
        match_pattern(&args[0], &args[1], true)
    });
    scalar(r, "glob", 2, |_, args| {
        match_pattern(&args[0], &args[1], false)
    });
    scalar(r, "nullif", 2, |_, args| {
        Ok(if args[0] == args[1] {
            Value::Null
        } else {
            args[0].clone()
        })
    });
    scalar(r, "quote", 1, |_, args| Ok(Value::from_text(&quote(&args[0]))));
    scalar(r, "soundex", 1, |_, args| {
        Ok(match &args[0] {
            Value::Null => Value::Null,
            v => Value::from_text(&soundex(&v.to_text())),
        })
    });
    scalar(r, "last_inserted_rowid", 0, |ctx, _| {
        Ok(Value::Int(ctx.last_rowid))
    });
    scalar(r, "version", 0, |_, _| {
        Ok(Value::from_text(env!("CARGO_PKG_VERSION")))
    });

    aggregate(
        r,
        "count",
        -1,
        |ctx, args| {
            if args.is_empty() || !args[0].is_null() {
                ctx.count += 1;
            }
            Ok(())
        },
        |ctx| Ok(Value::Int(ctx.count as i64)),
    );
    aggregate(
        r,
        "sum",
        1,
        |ctx, args| {
            if let Some(n) = args[0].as_number() {
                let state = sum_state(ctx);
                state.sum += n;
                if !matches!(args[0], Value::Int(_)) {
                    state.seen_real = true;
                }
                state.seen_any = true;
            }
            Ok(())
        },
        |ctx| {
            let state = sum_state(ctx);
            Ok(if !state.seen_any {
                Value::Null
            } else if state.seen_real {
                Value::Real(state.sum)
            } else {
                Value::Int(state.sum as i64)
            })
        },
    );
    aggregate(
        r,
        "avg",
        1,
        |ctx, args| {
            if let Some(n) = args[0].as_number() {
                let state = sum_state(ctx);
                state.sum += n;
                state.seen_any = true;
                ctx.count += 1;
            }
            Ok(())
        },
        |ctx| {
            let sum = sum_state(ctx).sum;
            Ok(if ctx.count == 0 {
                Value::Null
            } else {
                Value::Real(sum / ctx.count as f64)
            })
        },
    );
    aggregate(
        r,
        "min",
        1,
        |ctx, args| {
            min_max_step(ctx, &args[0], Ordering::Less);
            Ok(())
        },
        |ctx| Ok(take_value(ctx)),
    );
    aggregate(
        r,
        "max",
        1,
        |ctx, args| {
            min_max_step(ctx, &args[0], Ordering::Greater);
            Ok(())
        },
        |ctx| Ok(take_value(ctx)),
    );
    aggregate(
        r,
        "stddev",
        1,
        |ctx, args| {
            if let Some(n) = args[0].as_number() {
                let state = stddev_state(ctx);
                state.sum += n;
                state.sumsq += n * n;
                ctx.count += 1;
            }
            Ok(())
        },
        |ctx| {
            let n = ctx.count as f64;
            let state = stddev_state(ctx);
            Ok(if n < 2.0 {
                Value::Null
            } else {
                Value::Real(((state.sumsq - state.sum * state.sum / n) / (n - 1.0)).sqrt())
            })
        },
    );
}

#[derive(Default)]
struct SumState {
    sum: f64,
    seen_real: bool,
    seen_any: bool,
}

fn sum_state(ctx: &mut AggCtx) -> &mut SumState {
    ctx.state
        .get_or_insert_with(|| Box::new(SumState::default()))
        .downcast_mut::<SumState>()
        .expect("sum state")
}

#[derive(Default)]
struct StddevState {
    sum: f64,
    sumsq: f64,
}

fn stddev_state(ctx: &mut AggCtx) -> &mut StddevState {
    ctx.state
        .get_or_insert_with(|| Box::new(StddevState::default()))
        .downcast_mut::<StddevState>()
        .expect("stddev state")
}

fn min_max_step(ctx: &mut AggCtx, value: &Value, keep: Ordering) {
    if value.is_null() {
        return;
    }
    let best = ctx
        .state
        .get_or_insert_with(|| Box::new(Value::Null))
        .downcast_mut::<Value>()
        .expect("min/max state");
    if best.is_null() || value.compare(best) == keep {
        *best = value.clone();
    }
}

fn take_value(ctx: &mut AggCtx) -> Value {
    ctx.state
        .take()
        .and_then(|b| b.downcast::<Value>().ok())
        .map(|b| *b)
        .unwrap_or(Value::Null)
}

/// Scalar min/max: NULL if any argument is NULL.
fn extreme(args: &[Value], keep: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for arg in args {
        if arg.is_null() {
            return Value::Null;
        }
        best = match best {
            Some(b) if arg.compare(b) != keep => Some(b),
            _ => Some(arg),
        };
    }
    best.cloned().unwrap_or(Value::Null)
}

fn substr(args: &[Value]) -> Value {
    if args[0].is_null() {
        return Value::Null;
    }
    let text = args[0].to_text();
    let chars: Vec<char> = text.chars().collect();
    let len = chars.len() as i64;
    let mut start = args[1].as_int().unwrap_or(1);
    let count = args[2].as_int().unwrap_or(0).max(0);
    // 1-based; negative start counts back from the end.
    if start < 0 {
        start = (len + start).max(0) + 1;
    }
    if start < 1 {
        start = 1;
    }
    let from = (start - 1).min(len) as usize;
    let to = ((start - 1 + count).min(len)) as usize;
    Value::from_text(&chars[from..to].iter().collect::<String>())
}

fn round(value: &Value, digits: u32) -> Value {
    match value.as_number() {
        None => Value::Null,
        Some(n) => {
            let factor = 10f64.powi(digits as i32);
            Value::Real((n * factor).round() / factor)
        }
    }
}

fn quote(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Int(i) => i.to_string(),
        Value::Real(r) => r.to_string(),
        Value::Text(t) => format!("'{}'", t.as_str().replace('\'', "''")),
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("X'{hex}'")
        }
    }
}

/// LIKE/GLOB via a compiled regex. LIKE is case-insensitive with `%`/`_`
/// wildcards; GLOB is case-sensitive with `*`/`?` and `[...]` classes.
fn match_pattern(pattern: &Value, text: &Value, like: bool) -> Result<Value> {
    if pattern.is_null() || text.is_null() {
        return Ok(Value::Null);
    }
    let regex = pattern_to_regex(&pattern.to_text(), like);
    let compiled = fancy_regex::Regex::new(&regex)
        .map_err(|err| Error::sql(format!("malformed pattern: {err}")))?;
    let matched = compiled
        .is_match(&text.to_text())
        .map_err(|err| Error::sql(format!("pattern match failed: {err}")))?;
    Ok(Value::Int(matched as i64))
}

fn pattern_to_regex(pattern: &str, like: bool) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    if like {
        out.push_str("(?i)");
    }
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match (like, ch) {
            (true, '%') => out.push_str(".*"),
            (true, '_') => out.push('.'),
            (false, '*') => out.push_str(".*"),
            (false, '?') => out.push('.'),
            (false, '[') => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if matches!(inner, '\\') {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            (_, c) if "\\.^$|()[]{}*+?".contains(c) => {
                out.push('\\');
                out.push(c);
            }
            (_, c) => out.push(c),
        }
    }
    out.push('$');
    out
}

fn soundex(text: &str) -> String {
    fn code(ch: char) -> u8 {
        match ch.to_ascii_uppercase() {
            'B' | 'F' | 'P' | 'V' => b'1',
            'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => b'2',
            'D' | 'T' => b'3',
            'L' => b'4',
            'M' | 'N' => b'5',
            'R' => b'6',
            _ => 0,
        }
    }
    let mut chars = text.chars().filter(|c| c.is_ascii_alphabetic());
    let Some(first) = chars.next() else {
        return "?000".to_owned();
    };
    let mut out = String::new();
    out.push(first.to_ascii_uppercase());
    let mut prev = code(first);
    for ch in chars {
        let c = code(ch);
        if c != 0 && c != prev {
            out.push(c as char);
            if out.len() == 4 {
                break;
            }
        }
        prev = c;
    }
    while out.len() < 4 {
        out.push('0');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Value {
        let registry = FuncRegistry::with_builtins();
        let def = registry.find(name, args.len() as i32).unwrap();
        let FuncKind::Scalar(f) = &def.kind else {
            panic!("not scalar");
        };
        let mut ctx = FuncContext { last_rowid: 0 };
        f(&mut ctx, args).unwrap()
    }

    #[test]
    fn arity_dispatch_prefers_exact() {
        let registry = FuncRegistry::with_builtins();
        // min/1 resolves to the aggregate, min/2 to the scalar wildcard.
        assert!(registry.find("min", 1).unwrap().is_aggregate());
        assert!(!registry.find("MIN", 2).unwrap().is_aggregate());
        assert!(registry.find("no_such_fn", 1).is_none());
    }

    #[test]
    fn like_is_case_insensitive() {
        assert_eq!(
            call("like", &[Value::from_text("a%"), Value::from_text("ABC")]),
            Value::Int(1)
        );
        assert_eq!(
            call("like", &[Value::from_text("a_c"), Value::from_text("axc")]),
            Value::Int(1)
        );
        assert_eq!(
            call("like", &[Value::from_text("a.c"), Value::from_text("abc")]),
            Value::Int(0)
        );
    }

    #[test]
    fn glob_is_case_sensitive() {
        assert_eq!(
            call("glob", &[Value::from_text("a*"), Value::from_text("ABC")]),
            Value::Int(0)
        );
        assert_eq!(
            call("glob", &[Value::from_text("[ab]c"), Value::from_text("bc")]),
            Value::Int(1)
        );
    }

    #[test]
    fn substr_counts_from_one() {
        assert_eq!(
            call(
                "substr",
                &[Value::from_text("hello"), Value::Int(2), Value::Int(3)]
            ),
            Value::from_text("ell")
        );
        assert_eq!(
            call(
                "substr",
                &[Value::from_text("hello"), Value::Int(-3), Value::Int(2)]
            ),
            Value::from_text("ll")
        );
    }

    #[test]
    fn quote_escapes() {
        assert_eq!(call("quote", &[Value::from_text("it's")]).to_text(), "'it''s'");
        assert_eq!(call("quote", &[Value::Null]).to_text(), "NULL");
    }

    #[test]
    fn soundex_classic() {
        assert_eq!(call("soundex", &[Value::from_text("Robert")]).to_text(), "R163");
        assert_eq!(call("soundex", &[Value::from_text("Rupert")]).to_text(), "R163");
    }

    #[test]
    fn aggregate_sum_stays_integral() {
        let registry = FuncRegistry::with_builtins();
        let def = registry.find("sum", 1).unwrap();
        let FuncKind::Aggregate { step, finalize } = &def.kind else {
            panic!("not aggregate");
        };
        let mut ctx = AggCtx::default();
        for i in 1..=4 {
            step(&mut ctx, &[Value::Int(i)]).unwrap();
        }
        step(&mut ctx, &[Value::Null]).unwrap();
        assert_eq!(finalize(&mut ctx).unwrap(), Value::Int(10));
    }

    #[test]
    fn count_star_counts_rows() {
        let registry = FuncRegistry::with_builtins();
        let def = registry.find("count", 0).unwrap();
        let FuncKind::Aggregate { step, finalize } = &def.kind else {
            panic!("not aggregate");
        };
        let mut ctx = AggCtx::default();
        step(&mut ctx, &[]).unwrap();
        step(&mut ctx, &[]).unwrap();
        assert_eq!(finalize(&mut ctx).unwrap(), Value::Int(2));
    }
}
