use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed query algebra over analytical metadata fields. This is the only
/// query language users of the analytical adapter get; no raw SQL crosses
/// the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Eq {
        column: String,
        value: Value,
    },
    In {
        column: String,
        values: Vec<Value>,
    },
    /// Inclusive on both ends; either bound may be open.
    Range {
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<Value>,
    },
    And {
        preds: Vec<Predicate>,
    },
    Or {
        preds: Vec<Predicate>,
    },
    Not {
        pred: Box<Predicate>,
    },
}

impl Predicate {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Predicate::Eq {
            column: column.to_string(),
            value: value.into(),
        }
    }

    pub fn range(column: &str, min: Option<Value>, max: Option<Value>) -> Self {
        Predicate::Range {
            column: column.to_string(),
            min,
            max,
        }
    }

    pub fn and(preds: Vec<Predicate>) -> Self {
        Predicate::And { preds }
    }

    /// Render as a Postgres WHERE fragment over a JSONB document column,
    /// appending text bind values in traversal order (every bind is cast in
    /// SQL). String equality is case-insensitive and also matches membership
    /// in array-valued fields (`tags`), mirroring `eval`.
    pub fn to_sql(&self, doc: &str, binds: &mut Vec<String>) -> String {
        match self {
            Predicate::Eq { column, value } => {
                let key = json_key(doc, column);
                let text = json_text(doc, column);
                match value {
                    Value::Null => format!("{text} IS NULL"),
                    Value::String(s) => {
                        binds.push(s.clone());
                        let n = binds.len();
                        format!(
                            "({key} @> to_jsonb(${n}::text) OR lower({text}) = lower(${n}))"
                        )
                    }
                    Value::Bool(b) => {
                        binds.push(b.to_string());
                        format!("({text})::boolean = ${}::boolean", binds.len())
                    }
                    Value::Number(n) => {
                        binds.push(n.to_string());
                        format!("({text})::numeric = ${}::numeric", binds.len())
                    }
                    other => {
                        binds.push(other.to_string());
                        format!("{key} @> ${}::jsonb", binds.len())
                    }
                }
            }
            Predicate::In { column, values } => {
                if values.is_empty() {
                    return "FALSE".to_string();
                }
                let parts: Vec<String> = values
                    .iter()
                    .map(|v| {
                        Predicate::Eq {
                            column: column.clone(),
                            value: v.clone(),
                        }
                        .to_sql(doc, binds)
                    })
                    .collect();
                format!("({})", parts.join(" OR "))
            }
            Predicate::Range { column, min, max } => {
                let text = json_text(doc, column);
                let mut parts = Vec::new();
                for (bound, op) in [(min, ">="), (max, "<=")] {
                    if let Some(value) = bound {
                        match value {
                            Value::Number(n) => {
                                binds.push(n.to_string());
                                parts.push(format!(
                                    "({text})::numeric {op} ${}::numeric",
                                    binds.len()
                                ));
                            }
                            Value::String(s) => {
                                binds.push(s.clone());
                                parts.push(format!("{text} {op} ${}", binds.len()));
                            }
                            other => {
                                binds.push(other.to_string());
                                parts.push(format!("{text} {op} ${}", binds.len()));
                            }
                        }
                    }
                }
                if parts.is_empty() {
                    "TRUE".to_string()
                } else {
                    parts.join(" AND ")
                }
            }
            Predicate::And { preds } => combine(preds, "AND", "TRUE", doc, binds),
            Predicate::Or { preds } => combine(preds, "OR", "FALSE", doc, binds),
            Predicate::Not { pred } => format!("NOT ({})", pred.to_sql(doc, binds)),
        }
    }

    /// Pure evaluation against a flattened metadata document. Used by the
    /// in-memory analytical brain and by the vector adapter's metadata
    /// filter.
    pub fn eval(&self, row: &BTreeMap<String, Value>) -> bool {
        match self {
            Predicate::Eq { column, value } => row.get(column).is_some_and(|v| loose_eq(v, value)),
            Predicate::In { column, values } => row
                .get(column)
                .is_some_and(|v| values.iter().any(|candidate| loose_eq(v, candidate))),
            Predicate::Range { column, min, max } => {
                let Some(v) = row.get(column) else {
                    return false;
                };
                let above = min.as_ref().is_none_or(|m| loose_cmp(v, m) >= 0);
                let below = max.as_ref().is_none_or(|m| loose_cmp(v, m) <= 0);
                above && below
            }
            Predicate::And { preds } => preds.iter().all(|p| p.eval(row)),
            Predicate::Or { preds } => preds.iter().any(|p| p.eval(row)),
            Predicate::Not { pred } => !pred.eval(row),
        }
    }

    /// Whether this tree is a pure conjunction of equality/range leaves
    /// (`In` is multi-equality), the only shape the vector adapter's
    /// filter accepts.
    pub fn is_conjunctive_filter(&self) -> bool {
        match self {
            Predicate::Eq { .. } | Predicate::In { .. } | Predicate::Range { .. } => true,
            Predicate::And { preds } => preds.iter().all(|p| p.is_conjunctive_filter()),
            _ => false,
        }
    }
}

fn combine(
    preds: &[Predicate],
    joiner: &str,
    empty: &str,
    doc: &str,
    binds: &mut Vec<String>,
) -> String {
    if preds.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = preds
        .iter()
        .map(|p| format!("({})", p.to_sql(doc, binds)))
        .collect();
    parts.join(&format!(" {joiner} "))
}

fn quote_json_key(column: &str) -> String {
    format!("'{}'", column.replace('\'', "''"))
}

fn json_key(doc: &str, column: &str) -> String {
    format!("{doc} -> {}", quote_json_key(column))
}

fn json_text(doc: &str, column: &str) -> String {
    format!("{doc} ->> {}", quote_json_key(column))
}

/// Equality with case-insensitive strings, plus scalar-in-array membership
/// for multi-valued fields like `tags`.
fn loose_eq(row_value: &Value, pred_value: &Value) -> bool {
    match (row_value, pred_value) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        (Value::Array(items), scalar) if !scalar.is_array() => {
            items.iter().any(|item| loose_eq(item, scalar))
        }
        _ => row_value == pred_value,
    }
}

/// Three-way comparison across the scalar types the algebra admits.
/// Numbers compare numerically, strings lexically (this covers RFC 3339
/// timestamps). Incomparable values compare as unequal extremes.
fn loose_cmp(a: &Value, b: &Value) -> i32 {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            if x < y {
                -1
            } else if x > y {
                1
            } else {
                0
            }
        }
        (Value::String(x), Value::String(y)) => match x.cmp(y) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        },
        _ => i32::MAX,
    }
}
