//! `has!` loader plugin expressions
//!
//! A dependency such as `dojo/has!touch?./touch:./mouse` selects a module based on a
//! feature value. Expressions nest (`a?b?x:y:z`) and either branch may be empty, in
//! which case nothing is loaded on that side.
//!
//! When the feature value is known only one branch is taken. When it is not, both
//! branches are reachable and each is tagged with the term under which it is
//! reached, so expanded dependency queries can report which modules are included
//! under which feature assignments.

use std::collections::BTreeSet;
use std::fmt;

use super::{BooleanTerm, Features};

/// Parsed `has!` plugin expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HasNode {
    /// A module id leaf (possibly empty)
    Module(String),
    /// A feature test selecting one of two sub-expressions
    Branch {
        /// Feature name
        feature: String,
        /// Taken when the feature is true
        if_true: Box<HasNode>,
        /// Taken when the feature is false
        if_false: Box<HasNode>,
    },
}

impl HasNode {
    /// Parse the resource part of a `has!` dependency (the text after the `!`).
    #[must_use]
    pub fn parse(expression: &str) -> Self {
        let Some(question) = expression.find('?') else {
            return Self::Module(expression.to_string());
        };
        if expression[..question].contains(':') {
            return Self::Module(expression.to_string());
        }

        let feature = &expression[..question];
        let rest = &expression[question + 1..];

        // Find the ':' matching this '?', skipping pairs opened by nested tests.
        let mut depth = 0usize;
        let mut split = None;
        for (i, ch) in rest.char_indices() {
            match ch {
                '?' => depth += 1,
                ':' if depth == 0 => {
                    split = Some(i);
                    break;
                }
                ':' => depth -= 1,
                _ => {}
            }
        }

        let (if_true, if_false) = match split {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };

        Self::Branch {
            feature: feature.to_string(),
            if_true: Box::new(Self::parse(if_true)),
            if_false: Box::new(Self::parse(if_false)),
        }
    }

    /// Module selected by `features`, or `None` if an undefined feature is tested
    /// (unless `coerce_undefined_to_false`) or the selected branch is empty.
    #[must_use]
    pub fn evaluate(&self, features: &Features, coerce_undefined_to_false: bool) -> Option<&str> {
        match self {
            Self::Module(id) if id.is_empty() => None,
            Self::Module(id) => Some(id.as_str()),
            Self::Branch {
                feature,
                if_true,
                if_false,
            } => {
                let value = features
                    .get(feature)
                    .or_else(|| coerce_undefined_to_false.then_some(false))?;
                if value {
                    if_true.evaluate(features, coerce_undefined_to_false)
                } else {
                    if_false.evaluate(features, coerce_undefined_to_false)
                }
            }
        }
    }

    /// Every reachable module together with the term under which it is reached.
    ///
    /// Defined features pick one branch. Undefined features reach both branches, with
    /// the feature ANDed into `term` as true or false. Branches whose term would be
    /// contradictory are skipped.
    #[must_use]
    pub fn evaluate_all(&self, features: &Features, term: &BooleanTerm) -> Vec<(String, BooleanTerm)> {
        let mut out = Vec::new();
        self.collect(features, term, &mut out);
        out
    }

    fn collect(&self, features: &Features, term: &BooleanTerm, out: &mut Vec<(String, BooleanTerm)>) {
        match self {
            Self::Module(id) if id.is_empty() => {}
            Self::Module(id) => out.push((id.clone(), term.clone())),
            Self::Branch {
                feature,
                if_true,
                if_false,
            } => match features.get(feature) {
                Some(true) => if_true.collect(features, term, out),
                Some(false) => if_false.collect(features, term, out),
                None => {
                    for (state, branch) in [(true, if_true), (false, if_false)] {
                        if let Some(t) = term.and_with(&BooleanTerm::var(feature.clone(), state)) {
                            branch.collect(features, &t, out);
                        }
                    }
                }
            },
        }
    }

    /// Names of all features tested anywhere in the expression.
    #[must_use]
    pub fn features(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.visit(&mut |node| {
            if let Self::Branch { feature, .. } = node {
                names.insert(feature.clone());
            }
        });
        names
    }

    /// Non-empty module ids at the leaves.
    #[must_use]
    pub fn modules(&self) -> Vec<&str> {
        match self {
            Self::Module(id) if id.is_empty() => Vec::new(),
            Self::Module(id) => vec![id.as_str()],
            Self::Branch {
                if_true, if_false, ..
            } => {
                let mut ids = if_true.modules();
                ids.extend(if_false.modules());
                ids
            }
        }
    }

    /// Rewrite every non-empty leaf with `f`, stopping at the first error.
    pub fn try_map_modules<E>(&mut self, f: &mut impl FnMut(&str) -> Result<String, E>) -> Result<(), E> {
        match self {
            Self::Module(id) if id.is_empty() => Ok(()),
            Self::Module(id) => {
                *id = f(id)?;
                Ok(())
            }
            Self::Branch {
                if_true, if_false, ..
            } => {
                if_true.try_map_modules(f)?;
                if_false.try_map_modules(f)
            }
        }
    }

    fn visit(&self, f: &mut impl FnMut(&Self)) {
        f(self);
        if let Self::Branch {
            if_true, if_false, ..
        } = self
        {
            if_true.visit(f);
            if_false.visit(f);
        }
    }
}

impl fmt::Display for HasNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(id) => write!(f, "{id}"),
            Self::Branch {
                feature,
                if_true,
                if_false,
            } => write!(f, "{feature}?{if_true}:{if_false}"),
        }
    }
}

/// Whether a plugin module id names the `has` plugin (`has` or `<prefix>/has`).
#[must_use]
pub fn is_has_plugin(plugin: &str) -> bool {
    plugin == "has" || plugin.ends_with("/has")
}

/// Split `plugin!resource` at the first `!`.
#[must_use]
pub fn split_plugin(id: &str) -> Option<(&str, &str)> {
    id.split_once('!')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nested() {
        let node = HasNode::parse("a?b?x:y:z");
        assert_eq!(node.to_string(), "a?b?x:y:z");
        match &node {
            HasNode::Branch {
                feature,
                if_true,
                if_false,
            } => {
                assert_eq!(feature, "a");
                assert_eq!(if_true.to_string(), "b?x:y");
                assert_eq!(**if_false, HasNode::Module("z".to_string()));
            }
            HasNode::Module(_) => panic!("expected branch"),
        }
        assert_eq!(node.features().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(node.modules(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_parse_missing_false_branch() {
        let node = HasNode::parse("touch?./touch");
        assert_eq!(node.modules(), vec!["./touch"]);
        assert_eq!(node.evaluate(&Features::new().with("touch", false), false), None);
        assert_eq!(HasNode::parse("plain/module"), HasNode::Module("plain/module".to_string()));
    }

    #[test]
    fn test_evaluate_defined_and_undefined() {
        let node = HasNode::parse("a?x:y");
        assert_eq!(node.evaluate(&Features::new().with("a", true), false), Some("x"));
        assert_eq!(node.evaluate(&Features::new(), false), None);
        assert_eq!(node.evaluate(&Features::new(), true), Some("y"));
    }

    #[test]
    fn test_evaluate_all_branches_on_undefined() {
        let node = HasNode::parse("a?b?x:y:z");
        let results = node.evaluate_all(&Features::new().with("b", false), &BooleanTerm::new());

        let rendered: Vec<(String, String)> = results
            .into_iter()
            .map(|(id, term)| (id, term.to_string()))
            .collect();
        assert_eq!(
            rendered,
            vec![
                ("y".to_string(), "a".to_string()),
                ("z".to_string(), "!a".to_string()),
            ]
        );
    }

    #[test]
    fn test_evaluate_all_skips_contradictions() {
        let node = HasNode::parse("a?x:y");
        let results = node.evaluate_all(&Features::new(), &BooleanTerm::var("a", false));
        assert_eq!(results, vec![("y".to_string(), BooleanTerm::var("a", false))]);
    }

    #[test]
    fn test_plugin_helpers() {
        assert!(is_has_plugin("has"));
        assert!(is_has_plugin("dojo/has"));
        assert!(!is_has_plugin("dojo/hash"));
        assert_eq!(split_plugin("text!a.html"), Some(("text", "a.html")));
        assert_eq!(split_plugin("plain"), None);
    }

    #[test]
    fn test_try_map_modules() {
        let mut node = HasNode::parse("a?./x:");
        node.try_map_modules(&mut |id| Ok::<_, ()>(format!("pkg/{}", id.trim_start_matches("./"))))
            .unwrap();
        assert_eq!(node.to_string(), "a?pkg/x:");
    }
}
