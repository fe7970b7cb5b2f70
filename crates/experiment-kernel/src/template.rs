//! `{{name}}` placeholder substitution for prompt templates.

use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::variables::{ConditionSet, ConditionValue};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder pattern is valid"));

/// Replace every `{{name}}` with the matching condition value.
///
/// Reals are formatted with two decimals. Placeholders whose name is not in
/// `conditions` are left as written, so templates can be filled in passes.
pub fn substitute(text: &str, conditions: &ConditionSet) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures<'_>| match conditions.get(&caps[1]) {
            Some(value) => format_value(value),
            None => caps[0].to_string(),
        })
        .into_owned()
}

fn format_value(value: &ConditionValue) -> String {
    match value {
        ConditionValue::Real(r) => format!("{r:.2}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(pairs: &[(&str, ConditionValue)]) -> ConditionSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_substitute_real_two_decimals() {
        let c = conditions(&[("p", ConditionValue::Real(6.5))]);
        assert_eq!(substitute("Price: {{p}}", &c), "Price: 6.50");
    }

    #[test]
    fn test_substitute_missing_left_untouched() {
        assert_eq!(substitute("{{missing}}", &ConditionSet::default()), "{{missing}}");
        let c = conditions(&[("price", ConditionValue::Real(5.0))]);
        assert_eq!(
            substitute("The value is {{unknown_var}}.", &c),
            "The value is {{unknown_var}}."
        );
    }

    #[test]
    fn test_substitute_mixed_values() {
        let c = conditions(&[
            ("price", ConditionValue::Real(6.5)),
            ("color", ConditionValue::Text("red".to_string())),
            ("round_num", ConditionValue::Int(3)),
        ]);
        assert_eq!(
            substitute("The price is ${{price}} and color is {{color}}, round {{round_num}}.", &c),
            "The price is $6.50 and color is red, round 3."
        );
    }

    #[test]
    fn test_substitute_whitespace_in_placeholder() {
        let c = conditions(&[("price", ConditionValue::Real(4.0))]);
        assert_eq!(substitute("Value: {{ price }}.", &c), "Value: 4.00.");
    }

    #[test]
    fn test_single_braces_untouched() {
        let c = conditions(&[("PLAYER_DECISION", ConditionValue::Int(1))]);
        assert_eq!(substitute("offer {PLAYER_DECISION}", &c), "offer {PLAYER_DECISION}");
    }
}
