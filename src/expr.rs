//! Dimension Predicates
//!
//! Boolean filters evaluated against an entry's dimension map. Tables may
//! carry a predicate so followers only receive matching entries; the
//! canonical display form (lowercased) keys predicate memoization during
//! fan-out.

use serde::{Deserialize, Serialize};

use crate::wal::DimensionMap;

/// A boolean filter over entry dimensions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    /// Dimension equals a value
    Eq { dim: String, value: String },
    /// Dimension is one of a set of values
    In { dim: String, values: Vec<String> },
    /// Negation
    Not(Box<Predicate>),
    /// Conjunction (empty = true)
    All(Vec<Predicate>),
    /// Disjunction (empty = false)
    Any(Vec<Predicate>),
}

impl Predicate {
    /// Evaluate against a dimension map; absent dimensions never match
    pub fn eval(&self, dims: &DimensionMap<'_>) -> bool {
        match self {
            Predicate::Eq { dim, value } => {
                dims.get(dim).map(|v| v == value.as_bytes()).unwrap_or(false)
            }
            Predicate::In { dim, values } => dims
                .get(dim)
                .map(|v| values.iter().any(|candidate| v == candidate.as_bytes()))
                .unwrap_or(false),
            Predicate::Not(inner) => !inner.eval(dims),
            Predicate::All(preds) => preds.iter().all(|p| p.eval(dims)),
            Predicate::Any(preds) => preds.iter().any(|p| p.eval(dims)),
        }
    }
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Predicate::Eq { dim, value } => write!(f, "{} = '{}'", dim, value),
            Predicate::In { dim, values } => {
                write!(f, "{} in (", dim)?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}'", value)?;
                }
                write!(f, ")")
            }
            Predicate::Not(inner) => write!(f, "not ({})", inner),
            Predicate::All(preds) => join_preds(f, preds, " and "),
            Predicate::Any(preds) => join_preds(f, preds, " or "),
        }
    }
}

fn join_preds(
    f: &mut std::fmt::Formatter<'_>,
    preds: &[Predicate],
    sep: &str,
) -> std::fmt::Result {
    for (i, pred) in preds.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "({})", pred)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::{encode_dimensions, encode_payload, parse_dimensions};

    fn eval(pred: &Predicate, pairs: &[(&str, &[u8])]) -> bool {
        let dims = encode_dimensions(pairs);
        let data = encode_payload(0, &dims, b"");
        let map = parse_dimensions(&data).unwrap();
        pred.eval(&map)
    }

    #[test]
    fn eq_matches_value() {
        let pred = Predicate::Eq {
            dim: "region".into(),
            value: "eu".into(),
        };
        assert!(eval(&pred, &[("region", b"eu")]));
        assert!(!eval(&pred, &[("region", b"us")]));
        assert!(!eval(&pred, &[("country", b"eu")]));
    }

    #[test]
    fn in_matches_any_value() {
        let pred = Predicate::In {
            dim: "country".into(),
            values: vec!["us".into(), "de".into()],
        };
        assert!(eval(&pred, &[("country", b"de")]));
        assert!(!eval(&pred, &[("country", b"fr")]));
    }

    #[test]
    fn compound_predicates() {
        let pred = Predicate::All(vec![
            Predicate::Eq {
                dim: "region".into(),
                value: "eu".into(),
            },
            Predicate::Not(Box::new(Predicate::Eq {
                dim: "country".into(),
                value: "uk".into(),
            })),
        ]);
        assert!(eval(&pred, &[("region", b"eu"), ("country", b"de")]));
        assert!(!eval(&pred, &[("region", b"eu"), ("country", b"uk")]));
    }

    #[test]
    fn display_is_stable() {
        let pred = Predicate::All(vec![
            Predicate::Eq {
                dim: "Region".into(),
                value: "EU".into(),
            },
            Predicate::In {
                dim: "country".into(),
                values: vec!["us".into(), "de".into()],
            },
        ]);
        assert_eq!(
            pred.to_string(),
            "(Region = 'EU') and (country in ('us', 'de'))"
        );
        assert_eq!(
            pred.to_string().to_lowercase(),
            "(region = 'eu') and (country in ('us', 'de'))"
        );
    }
}
