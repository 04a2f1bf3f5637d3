//! `{{.name}}` placeholder substitution.
//!
//! Substitution is applied repeatedly so a value may reference a parameter
//! whose own value holds placeholders. It stops as soon as a pass changes
//! nothing, or after [`MAX_PASSES`]. Placeholders naming unknown parameters
//! are left verbatim.

use crate::parameter::{Parameter, ParameterBag};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// Upper bound on substitution passes.
pub const MAX_PASSES: usize = 10;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\.([A-Za-z0-9_.\-]+)\}\}").expect("placeholder pattern is valid")
});

fn substitute_once(input: &str, bag: &ParameterBag) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| {
            let name = caps.get(1).map_or("", |m| m.as_str());
            match bag.get(name) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Whether the input still contains a placeholder.
pub fn has_placeholders(input: &str) -> bool {
    PLACEHOLDER.is_match(input)
}

/// Resolve placeholders in `input` against `bag`.
pub fn resolve(input: &str, bag: &ParameterBag) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_PASSES {
        if !has_placeholders(&current) {
            break;
        }
        let next = substitute_once(&current, bag);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Resolve every value of the bag against the bag itself.
pub fn resolve_bag(bag: &ParameterBag) -> ParameterBag {
    let mut resolved = bag.clone();
    for _ in 0..MAX_PASSES {
        let snapshot = resolved.clone();
        let mut changed = false;
        for param in resolved.iter_mut() {
            let next = substitute_once(&param.value, &snapshot);
            if next != param.value {
                param.value = next;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    resolved
}

/// Resolve a trigger's parameter values against the parent build's bag.
pub fn process_trigger_parameters(
    trigger_params: &[Parameter],
    parent: &ParameterBag,
) -> Vec<Parameter> {
    trigger_params
        .iter()
        .map(|p| Parameter {
            value: resolve(&p.value, parent),
            ..p.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag(pairs: &[(&str, &str)]) -> ParameterBag {
        pairs.iter().map(|(k, v)| Parameter::new(*k, *v)).collect()
    }

    #[test]
    fn test_simple_substitution() {
        let b = bag(&[("git.branch", "main"), ("name", "api")]);
        assert_eq!(resolve("{{.name}}@{{.git.branch}}", &b), "api@main");
    }

    #[test]
    fn test_nested_substitution() {
        let b = bag(&[("a", "{{.b}}-x"), ("b", "{{.c}}"), ("c", "deep")]);
        assert_eq!(resolve("{{.a}}", &b), "deep-x");
    }

    #[test]
    fn test_unknown_placeholder_left_verbatim() {
        let b = bag(&[("a", "1")]);
        assert_eq!(resolve("{{.a}} {{.missing}}", &b), "1 {{.missing}}");
    }

    #[test]
    fn test_mutual_reference_terminates() {
        let b = bag(&[("a", "{{.b}}"), ("b", "{{.a}}")]);

        let resolved = resolve_bag(&b);
        let a = resolved.get("a").unwrap();
        let b2 = resolved.get("b").unwrap();
        assert!(has_placeholders(a));
        assert!(has_placeholders(b2));

        assert!(has_placeholders(&resolve("{{.a}}", &b)));
    }

    #[test]
    fn test_self_reference_is_bounded() {
        let b = bag(&[("a", "x{{.a}}")]);
        let out = resolve("{{.a}}", &b);
        assert!(out.starts_with(&"x".repeat(MAX_PASSES)));
        assert!(out.ends_with("{{.a}}"));
    }

    #[test]
    fn test_process_trigger_parameters() {
        let parent = bag(&[("git.branch", "release/1.2"), ("cds.version", "42")]);
        let params = vec![
            Parameter::new("tag", "v{{.cds.version}}"),
            Parameter::new("branch", "{{.git.branch}}"),
        ];

        let processed = process_trigger_parameters(&params, &parent);
        assert_eq!(processed[0].value, "v42");
        assert_eq!(processed[1].value, "release/1.2");
    }
}
