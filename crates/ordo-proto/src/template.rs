// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Templates: positional patterns over tuples.
//!
//! Each field position is exact, wildcard, or an interval. A template may also
//! carry a [`Refinement`] that rejects tuples on criteria the positional
//! patterns cannot express (e.g. a geographic bounding box over two fields).

use crate::{Tuple, Value};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// Pattern for a single field position.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPattern {
    /// Matches only an equal value.
    Exact(Value),
    /// Matches anything.
    Any,
    /// Matches values contained in the interval.
    Range {
        /// Lower bound.
        lo: Bound<Value>,
        /// Upper bound.
        hi: Bound<Value>,
    },
}

impl FieldPattern {
    /// Inclusive interval `lo..=hi`.
    pub fn between(lo: impl Into<Value>, hi: impl Into<Value>) -> Self {
        FieldPattern::Range {
            lo: Bound::Included(lo.into()),
            hi: Bound::Included(hi.into()),
        }
    }

    /// Half-open interval `lo..hi`.
    pub fn half_open(lo: impl Into<Value>, hi: impl Into<Value>) -> Self {
        FieldPattern::Range {
            lo: Bound::Included(lo.into()),
            hi: Bound::Excluded(hi.into()),
        }
    }

    /// True if `value` satisfies this pattern.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldPattern::Exact(expected) => expected == value,
            FieldPattern::Any => true,
            FieldPattern::Range { lo, hi } => {
                let above = match lo {
                    Bound::Included(lo) => matches!(
                        value.compare(lo),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    Bound::Excluded(lo) => matches!(value.compare(lo), Some(Ordering::Greater)),
                    Bound::Unbounded => true,
                };
                let below = match hi {
                    Bound::Included(hi) => {
                        matches!(value.compare(hi), Some(Ordering::Less | Ordering::Equal))
                    }
                    Bound::Excluded(hi) => matches!(value.compare(hi), Some(Ordering::Less)),
                    Bound::Unbounded => true,
                };
                above && below
            }
        }
    }
}

macro_rules! exact_from {
    ($($ty:ty),*) => {
        $(impl From<$ty> for FieldPattern {
            fn from(v: $ty) -> Self {
                FieldPattern::Exact(Value::from(v))
            }
        })*
    };
}

exact_from!(Value, bool, i32, i64, f64, &str, String, Vec<u8>);

/// Extra acceptance test applied after the positional patterns succeed.
pub trait Refinement: Send + Sync {
    /// Return false to reject a structurally matching tuple.
    fn accepts(&self, tuple: &Tuple) -> bool;
}

impl<F> Refinement for F
where
    F: Fn(&Tuple) -> bool + Send + Sync,
{
    fn accepts(&self, tuple: &Tuple) -> bool {
        self(tuple)
    }
}

/// Pattern over whole tuples.
#[derive(Clone)]
pub struct Template {
    fields: Option<Vec<FieldPattern>>,
    refinement: Option<Arc<dyn Refinement>>,
}

impl Template {
    /// Template with one pattern per field; only tuples of the same arity match.
    pub fn new(fields: Vec<FieldPattern>) -> Self {
        Self {
            fields: Some(fields),
            refinement: None,
        }
    }

    /// Template matching every tuple regardless of arity.
    pub fn any() -> Self {
        Self {
            fields: None,
            refinement: None,
        }
    }

    /// All-exact template equal to `tuple`.
    pub fn from_tuple(tuple: &Tuple) -> Self {
        Self::new(
            tuple
                .fields()
                .iter()
                .cloned()
                .map(FieldPattern::Exact)
                .collect(),
        )
    }

    /// Attach an auxiliary refinement.
    pub fn refine(mut self, refinement: impl Refinement + 'static) -> Self {
        self.refinement = Some(Arc::new(refinement));
        self
    }

    /// Pure predicate: does this template accept `tuple`?
    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(fields) = &self.fields {
            if fields.len() != tuple.len() {
                return false;
            }
            if !fields
                .iter()
                .zip(tuple.fields())
                .all(|(pat, value)| pat.matches(value))
            {
                return false;
            }
        }
        self.refinement.as_ref().is_none_or(|r| r.accepts(tuple))
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("fields", &self.fields)
            .field("refined", &self.refinement.is_some())
            .finish()
    }
}

impl From<Tuple> for Template {
    fn from(t: Tuple) -> Self {
        Template::from_tuple(&t)
    }
}

/// Build a [`Template`] from field patterns; `_` is the wildcard.
///
/// ```
/// use ordo_proto::{template, tuple, FieldPattern};
/// let t = template!["task", _, FieldPattern::between(1, 5)];
/// assert!(t.matches(&tuple!["task", "anything", 3]));
/// ```
#[macro_export]
macro_rules! template {
    (@acc [$($out:expr),*]) => {
        $crate::Template::new(vec![$($out),*])
    };
    (@acc [$($out:expr),*] _ $(, $($rest:tt)*)?) => {
        $crate::template!(@acc [$($out,)* $crate::FieldPattern::Any] $($($rest)*)?)
    };
    (@acc [$($out:expr),*] $e:expr $(, $($rest:tt)*)?) => {
        $crate::template!(@acc [$($out,)* $crate::FieldPattern::from($e)] $($($rest)*)?)
    };
    ($($t:tt)*) => {
        $crate::template!(@acc [] $($t)*)
    };
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn exact_any_and_range_fields() {
        let t = Template::new(vec![
            FieldPattern::from("task"),
            FieldPattern::Any,
            FieldPattern::half_open(0, 10),
        ]);
        assert!(t.matches(&tuple!["task", 1, 0]));
        assert!(t.matches(&tuple!["task", "x", 9.5]));
        assert!(!t.matches(&tuple!["task", 1, 10]));
        assert!(!t.matches(&tuple!["job", 1, 1]));
        assert!(!t.matches(&tuple!["task", 1, "3"]));
        assert!(!t.matches(&tuple!["task", 1]));
    }

    #[test]
    fn refinement_rejects_structural_matches() {
        // lat in field 1, lng in field 2; the refinement enforces a box
        let poi = template!["poi", _, _].refine(|t: &Tuple| {
            let inside = |v: Option<&Value>, lo: f64, hi: f64| {
                FieldPattern::between(lo, hi).matches(v.unwrap_or(&Value::Null))
            };
            inside(t.get(1), 10.0, 20.0) && inside(t.get(2), -5.0, 5.0)
        });
        assert!(poi.matches(&tuple!["poi", 12.0, 0.0]));
        assert!(!poi.matches(&tuple!["poi", 30.0, 0.0]));
        assert!(!poi.matches(&tuple!["shop", 12.0, 0.0]));
    }

    #[test]
    fn any_template_matches_every_arity() {
        let t = Template::any();
        assert!(t.matches(&tuple![]));
        assert!(t.matches(&tuple![1, 2, 3]));
    }

    #[test]
    fn template_macro_wildcards() {
        let t = template!["a", _];
        assert!(t.matches(&tuple!["a", Value::Null]));
        assert!(!t.matches(&tuple!["b", 1]));
    }
}
