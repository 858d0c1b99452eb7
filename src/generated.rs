//! Generated column values: serial ids, row ids and column defaults.
//!
//! Serial and row-id values come from a [`GeneratedValueProvider`]. The
//! catalog owns the real allocator; [`SequenceProvider`] is an in-process
//! atomic counter with the same contract, used for standalone loads and tests.
//!
//! Column defaults are reduced once per load by [`reduce_default`]. Literal
//! and time defaults collapse to a constant that every row reuses; anything
//! else must be evaluated per row by a [`DefaultEvaluator`].

use crate::error::{LoadError, Result};
use chrono::{DateTime, Local};
use regex::Regex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, LazyLock};

/// Source of surrogate values for one generated column.
///
/// Implementations are shared by all processors of a load and must
/// serialize concurrent allocation themselves.
pub trait GeneratedValueProvider: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    /// Hand out the next value.
    ///
    /// # Errors
    /// [`LoadError::GeneratorExhausted`] when no value can be allocated.
    fn next_value(&self) -> Result<String>;

    /// Report the largest value the input supplied for this column, so later
    /// allocations do not collide with it.
    fn observe_max(&self, _value: i64) {}
}

/// Atomic counter handing out consecutive integers up to an optional limit.
///
/// `i64::MAX` itself is never handed out: the counter is exhausted once it
/// reaches it.
#[derive(Debug)]
pub struct SequenceProvider {
    name: String,
    next: AtomicI64,
    limit: i64,
}

impl SequenceProvider {
    /// Counter starting at `start` with no upper limit.
    pub fn new(name: impl Into<String>, start: i64) -> Self {
        Self {
            name: name.into(),
            next: AtomicI64::new(start),
            limit: i64::MAX,
        }
    }

    /// Last value this provider may hand out.
    #[must_use]
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// The value the next call to `next_value` would return.
    #[must_use]
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl GeneratedValueProvider for SequenceProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_value(&self) -> Result<String> {
        let limit = self.limit;
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                cur.checked_add(1).filter(|_| cur <= limit)
            })
            .map(|v| v.to_string())
            .map_err(|_| LoadError::exhausted(&self.name))
    }

    fn observe_max(&self, value: i64) {
        self.next.fetch_max(value.saturating_add(1), Ordering::SeqCst);
    }
}

/// Evaluates non-constant default expressions, one call per row.
pub trait DefaultEvaluator: Send + Sync {
    /// Value for `column` from `expression`; `None` is SQL NULL.
    ///
    /// # Errors
    /// Any failure of the underlying evaluation.
    fn evaluate(&self, column: &str, expression: &str) -> Result<Option<String>>;
}

/// The catalog hooks available to one load.
#[derive(Clone, Default)]
pub struct Generators {
    pub serial: Option<Arc<dyn GeneratedValueProvider>>,
    pub row_id: Option<Arc<dyn GeneratedValueProvider>>,
    pub evaluator: Option<Arc<dyn DefaultEvaluator>>,
}

/// A default expression after per-load reduction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReducedDefault {
    /// Same value for every row; `None` is SQL NULL.
    Constant(Option<String>),
    /// Must be evaluated for each row.
    PerRow(String),
}

static TYPED_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(date|time|timestamp(?:\s+with(?:out)?\s+time\s+zone)?)\s*'((?:[^']|'')*)'$")
        .expect("typed literal regex")
});
static CAST_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^'((?:[^']|'')*)'\s*::\s*[A-Za-z_][A-Za-z0-9_ ()]*$")
        .expect("cast literal regex")
});
// A whole expression that is one string literal; inner quotes are doubled.
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^'((?:[^']|'')*)'$").expect("quoted literal regex"));
static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?$").expect("number regex")
});

/// Reduce a default expression to its per-load form.
///
/// Handles quoted strings (with `''` unescaping), typed literals
/// (`DATE '...'`, `TIME '...'`, `TIMESTAMP '...'`), `'...'::type` casts,
/// numbers, booleans, `NULL`, and the time functions `CURRENT_DATE`,
/// `CURRENT_TIME`, `CURRENT_TIMESTAMP`, `LOCALTIMESTAMP` and `NOW()`, which are
/// evaluated once against `load_start`.
#[must_use]
pub fn reduce_default(expression: &str, load_start: DateTime<Local>) -> ReducedDefault {
    let mut expr = expression.trim();
    while let Some(inner) = strip_outer_parens(expr) {
        expr = inner.trim();
    }

    if let Some(caps) = TYPED_LITERAL.captures(expr) {
        return ReducedDefault::Constant(Some(unquote_sql(&caps[2])));
    }
    if let Some(caps) = CAST_LITERAL.captures(expr) {
        return ReducedDefault::Constant(Some(unquote_sql(&caps[1])));
    }
    if let Some(caps) = QUOTED.captures(expr) {
        return ReducedDefault::Constant(Some(unquote_sql(&caps[1])));
    }
    if NUMBER.is_match(expr) {
        return ReducedDefault::Constant(Some(expr.to_string()));
    }

    let lowered = expr.to_ascii_lowercase();
    match lowered.as_str() {
        "null" => ReducedDefault::Constant(None),
        "true" | "false" => ReducedDefault::Constant(Some(lowered)),
        "current_date" => {
            ReducedDefault::Constant(Some(load_start.format("%Y-%m-%d").to_string()))
        }
        "current_time" | "localtime" => {
            ReducedDefault::Constant(Some(load_start.format("%H:%M:%S%.6f").to_string()))
        }
        "current_timestamp" | "localtimestamp" | "now()" => ReducedDefault::Constant(Some(
            load_start.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
        )),
        _ => ReducedDefault::PerRow(expr.to_string()),
    }
}

// `(a) + (b)` keeps its parentheses; only a pair enclosing everything goes.
fn strip_outer_parens(expr: &str) -> Option<&str> {
    let inner = expr.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i32;
    for c in inner.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    (depth == 0).then_some(inner)
}

fn unquote_sql(body: &str) -> String {
    body.replace("''", "'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::thread;

    fn start() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap()
    }

    #[test]
    fn sequence_hands_out_consecutive_values() {
        let seq = SequenceProvider::new("serial", 5);
        assert_eq!(seq.next_value().unwrap(), "5");
        assert_eq!(seq.next_value().unwrap(), "6");
        assert_eq!(seq.peek(), 7);
    }

    #[test]
    fn sequence_exhausts_at_limit() {
        let seq = SequenceProvider::new("rowid", 1).with_limit(2);
        seq.next_value().unwrap();
        seq.next_value().unwrap();
        assert!(matches!(
            seq.next_value(),
            Err(LoadError::GeneratorExhausted { .. })
        ));
    }

    #[test]
    fn sequence_stops_before_overflow() {
        let seq = SequenceProvider::new("serial", i64::MAX - 1);
        assert_eq!(seq.next_value().unwrap(), (i64::MAX - 1).to_string());
        assert!(matches!(
            seq.next_value(),
            Err(LoadError::GeneratorExhausted { .. })
        ));
        assert!(seq.next_value().is_err());

        let seeded = SequenceProvider::new("rowid", 1);
        seeded.observe_max(i64::MAX);
        assert!(seeded.next_value().is_err());
    }

    #[test]
    fn observe_max_reseeds_past_supplied_values() {
        let seq = SequenceProvider::new("serial", 1);
        seq.observe_max(41);
        seq.observe_max(7);
        assert_eq!(seq.next_value().unwrap(), "42");
    }

    #[test]
    fn concurrent_allocation_never_repeats() {
        let seq = Arc::new(SequenceProvider::new("serial", 0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || {
                    (0..250)
                        .map(|_| seq.next_value().unwrap().parse::<i64>().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn literals_reduce_to_constants() {
        let c = |s: &str| reduce_default(s, start());
        assert_eq!(c("'it''s'"), ReducedDefault::Constant(Some("it's".into())));
        assert_eq!(c("( 42 )"), ReducedDefault::Constant(Some("42".into())));
        assert_eq!(c("NULL"), ReducedDefault::Constant(None));
        assert_eq!(c("TRUE"), ReducedDefault::Constant(Some("true".into())));
        assert_eq!(
            c("DATE '2020-01-02'"),
            ReducedDefault::Constant(Some("2020-01-02".into()))
        );
        assert_eq!(
            c("'2020-01-02 03:04:05'::timestamp without time zone"),
            ReducedDefault::Constant(Some("2020-01-02 03:04:05".into()))
        );
    }

    #[test]
    fn time_functions_use_load_start() {
        assert_eq!(
            reduce_default("current_date", start()),
            ReducedDefault::Constant(Some("2024-03-09".into()))
        );
        assert_eq!(
            reduce_default("NOW()", start()),
            ReducedDefault::Constant(Some("2024-03-09 14:05:06.000000".into()))
        );
    }

    #[test]
    fn other_expressions_are_per_row() {
        assert_eq!(
            reduce_default("(a) + (b)", start()),
            ReducedDefault::PerRow("(a) + (b)".into())
        );
        assert_eq!(
            reduce_default("nextval('s')", start()),
            ReducedDefault::PerRow("nextval('s')".into())
        );
    }

    #[test]
    fn concatenated_literals_are_per_row() {
        for expr in ["'a' || 'b'", "'a' || 'b'::text", "DATE '2020-01-02' || 'x'"] {
            assert_eq!(
                reduce_default(expr, start()),
                ReducedDefault::PerRow(expr.into()),
                "{expr}"
            );
        }
        assert_eq!(
            reduce_default("'a''b'::text", start()),
            ReducedDefault::Constant(Some("a'b".into()))
        );
    }
}
