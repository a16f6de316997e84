//! Boolean formulas over named feature flags
//!
//! Feature-conditional dependencies are described by formulas in sum-of-products
//! form: a [`BooleanFormula`] is a disjunction of [`BooleanTerm`]s and each term is a
//! conjunction of [`BooleanVar`]s (a feature name plus the state it must have).
//!
//! TRUE and FALSE are explicit variants rather than special term collections, so a
//! formula with no terms is never confused with one whose only term is empty:
//!
//! ```rust
//! use aggr_core::formula::{BooleanFormula, BooleanTerm};
//!
//! let mut formula = BooleanFormula::False;
//! formula.add_term(BooleanTerm::var("dom", true).with("ie", false));
//! formula.add_term(BooleanTerm::var("dom", true).with("ie", true));
//!
//! let simplified = formula.simplify().unwrap();
//! assert_eq!(simplified.to_string(), "dom");
//! ```
//!
//! Formulas can also be written as text: terms separated by `|` (or `+`), variables
//! within a term separated by `*`, negation with a leading `!`.
//!
//! # Modules
//!
//! - [`minimizer`] - prime implicant minimization behind [`BooleanFormula::simplify`]
//! - [`has`] - `has!` loader plugin expressions that branch on feature values

pub mod has;
pub mod minimizer;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::core::AggrError;

pub use has::HasNode;

/// A feature name paired with the state it is asserted to have.
///
/// Ordering is by name first, with the negated form sorting before the positive one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BooleanVar {
    /// Feature name
    pub name: String,
    /// Asserted state
    pub state: bool,
}

impl BooleanVar {
    /// Create a variable assertion.
    pub fn new(name: impl Into<String>, state: bool) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }
}

impl fmt::Display for BooleanVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.state {
            write!(f, "{}", self.name)
        } else {
            write!(f, "!{}", self.name)
        }
    }
}

/// A conjunction of variable assertions. The empty term is TRUE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BooleanTerm(BTreeSet<BooleanVar>);

impl BooleanTerm {
    /// The empty (always true) term.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A term asserting a single variable.
    pub fn var(name: impl Into<String>, state: bool) -> Self {
        let mut vars = BTreeSet::new();
        vars.insert(BooleanVar::new(name, state));
        Self(vars)
    }

    /// Add another assertion to this term.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, state: bool) -> Self {
        self.0.insert(BooleanVar::new(name, state));
        self
    }

    /// Variables asserted by this term, in canonical order.
    pub fn vars(&self) -> impl Iterator<Item = &BooleanVar> {
        self.0.iter()
    }

    /// Number of assertions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this term asserts nothing (and is therefore TRUE).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the term asserts both states of some variable.
    #[must_use]
    pub fn is_contradictory(&self) -> bool {
        self.0
            .iter()
            .zip(self.0.iter().skip(1))
            .any(|(a, b)| a.name == b.name)
    }

    /// Conjunction of two terms, or `None` when the result is contradictory.
    #[must_use]
    pub fn and_with(&self, other: &Self) -> Option<Self> {
        let combined = Self(self.0.union(&other.0).cloned().collect());
        (!combined.is_contradictory()).then_some(combined)
    }

    /// Substitute known feature values.
    ///
    /// Returns `None` when some assertion is falsified. Undefined features stay in
    /// the term unless `coerce_undefined_to_false` is set, in which case they are
    /// treated as false.
    #[must_use]
    pub fn resolve_with(&self, features: &Features, coerce_undefined_to_false: bool) -> Option<Self> {
        let mut resolved = BTreeSet::new();
        for var in &self.0 {
            let value = match features.get(&var.name) {
                Some(value) => Some(value),
                None if coerce_undefined_to_false => Some(false),
                None => None,
            };
            match value {
                Some(value) if value != var.state => return None,
                Some(_) => {}
                None => {
                    resolved.insert(var.clone());
                }
            }
        }
        let term = Self(resolved);
        (!term.is_contradictory()).then_some(term)
    }
}

impl fmt::Display for BooleanTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "TRUE");
        }
        for (i, var) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "*")?;
            }
            write!(f, "{var}")?;
        }
        Ok(())
    }
}

impl FromIterator<BooleanVar> for BooleanTerm {
    fn from_iter<I: IntoIterator<Item = BooleanVar>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A sum-of-products formula.
///
/// `Terms` is never empty when built through the constructors on this type; a
/// disjunction with no terms is [`BooleanFormula::False`] and one containing the
/// empty term is [`BooleanFormula::True`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BooleanFormula {
    /// Always true
    True,
    /// Always false
    False,
    /// Disjunction of terms
    Terms(BTreeSet<BooleanTerm>),
}

impl Default for BooleanFormula {
    fn default() -> Self {
        Self::False
    }
}

impl BooleanFormula {
    /// Build a formula from a collection of terms.
    pub fn from_terms(terms: impl IntoIterator<Item = BooleanTerm>) -> Self {
        let mut formula = Self::False;
        for term in terms {
            formula.add_term(term);
            if formula.is_true() {
                break;
            }
        }
        formula
    }

    /// Whether this formula is the TRUE constant.
    #[must_use]
    pub const fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }

    /// Whether this formula is the FALSE constant.
    #[must_use]
    pub fn is_false(&self) -> bool {
        match self {
            Self::False => true,
            Self::Terms(terms) => terms.is_empty(),
            Self::True => false,
        }
    }

    /// Terms of this formula (empty for the constants).
    pub fn terms(&self) -> impl Iterator<Item = &BooleanTerm> {
        let terms = match self {
            Self::Terms(terms) => Some(terms.iter()),
            _ => None,
        };
        terms.into_iter().flatten()
    }

    /// Whether `term` is already one of this formula's terms, or the formula is TRUE.
    #[must_use]
    pub fn contains_term(&self, term: &BooleanTerm) -> bool {
        match self {
            Self::True => true,
            Self::False => false,
            Self::Terms(terms) => terms.contains(term),
        }
    }

    /// OR a term into this formula. Returns `true` if the formula changed.
    pub fn add_term(&mut self, term: BooleanTerm) -> bool {
        match self {
            Self::True => false,
            _ if term.is_empty() => {
                *self = Self::True;
                true
            }
            Self::False => {
                let mut terms = BTreeSet::new();
                terms.insert(term);
                *self = Self::Terms(terms);
                true
            }
            Self::Terms(terms) => terms.insert(term),
        }
    }

    /// OR another formula into this one.
    pub fn or_with(&mut self, other: &Self) -> &mut Self {
        match other {
            Self::True => *self = Self::True,
            Self::False => {}
            Self::Terms(terms) => {
                for term in terms {
                    self.add_term(term.clone());
                }
            }
        }
        self
    }

    /// Conjunction of two formulas, distributing terms and dropping contradictions.
    #[must_use]
    pub fn and_with(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::False, _) | (_, Self::False) => Self::False,
            (Self::True, f) | (f, Self::True) => f.clone(),
            (Self::Terms(left), Self::Terms(right)) => Self::from_terms(
                left.iter()
                    .flat_map(|l| right.iter().filter_map(move |r| l.and_with(r))),
            ),
        }
    }

    /// Substitute known feature values into every term.
    #[must_use]
    pub fn resolve_with(&self, features: &Features, coerce_undefined_to_false: bool) -> Self {
        match self {
            Self::True | Self::False => self.clone(),
            Self::Terms(terms) => Self::from_terms(
                terms
                    .iter()
                    .filter_map(|t| t.resolve_with(features, coerce_undefined_to_false)),
            ),
        }
    }

    /// Evaluate under `features`, or `None` if the value depends on undefined features.
    #[must_use]
    pub fn evaluate(&self, features: &Features) -> Option<bool> {
        let resolved = self.resolve_with(features, false);
        if resolved.is_true() {
            Some(true)
        } else if resolved.is_false() {
            Some(false)
        } else {
            None
        }
    }

    /// Names of all variables referenced by this formula.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<&str> {
        self.terms()
            .flat_map(|t| t.vars().map(|v| v.name.as_str()))
            .collect()
    }

    /// Minimal sum-of-products formula equivalent to this one.
    ///
    /// # Errors
    ///
    /// Returns [`AggrError::TooManyVariables`] if the formula references more than
    /// [`MAX_FORMULA_VARIABLES`](crate::constants::MAX_FORMULA_VARIABLES) variables.
    pub fn simplify(&self) -> Result<Self, AggrError> {
        match self {
            Self::True | Self::False => Ok(self.clone()),
            Self::Terms(terms) => minimizer::minimize(terms),
        }
    }
}

impl fmt::Display for BooleanFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "TRUE"),
            Self::False => write!(f, "FALSE"),
            Self::Terms(terms) if terms.is_empty() => write!(f, "FALSE"),
            Self::Terms(terms) => {
                let multiple = terms.len() > 1;
                for (i, term) in terms.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    if multiple && term.len() > 1 {
                        write!(f, "({term})")?;
                    } else {
                        write!(f, "{term}")?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl FromStr for BooleanFormula {
    type Err = AggrError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AggrError::InvalidFormula {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("true") {
            return Ok(Self::True);
        }
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("false") {
            return Ok(Self::False);
        }

        let mut formula = Self::False;
        for term_text in trimmed.split(['|', '+']) {
            let term_text = term_text.trim();
            let term_text = term_text
                .strip_prefix('(')
                .and_then(|t| t.strip_suffix(')'))
                .unwrap_or(term_text);
            if term_text.eq_ignore_ascii_case("true") {
                formula.add_term(BooleanTerm::new());
                continue;
            }
            let mut term = BooleanTerm::new();
            for var_text in term_text.split('*') {
                let var_text = var_text.trim();
                let (name, state) = match var_text.strip_prefix('!') {
                    Some(name) => (name.trim(), false),
                    None => (var_text, true),
                };
                if name.is_empty() {
                    return Err(invalid("empty variable name"));
                }
                if name.contains(['(', ')', '!']) {
                    return Err(invalid("unexpected character in variable name"));
                }
                term = term.with(name, state);
            }
            formula.add_term(term);
        }
        Ok(formula)
    }
}

/// Concrete feature values supplied with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Features(BTreeMap<String, bool>);

impl Features {
    /// No defined features.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a feature, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: bool) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    /// Define or redefine a feature.
    pub fn set(&mut self, name: impl Into<String>, value: bool) {
        self.0.insert(name.into(), value);
    }

    /// Value of a feature, if defined.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(name).copied()
    }

    /// Whether a feature is defined.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Defined features in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Whether no feature is defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}{name}", if *value { "" } else { "!" })?;
        }
        write!(f, "}}")
    }
}

impl<S: Into<String>> FromIterator<(S, bool)> for Features {
    fn from_iter<I: IntoIterator<Item = (S, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
