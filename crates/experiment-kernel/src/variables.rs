//! Experimental variables and condition randomization.
//!
//! A scenario declares named variables. Each session gets one concrete
//! [`ConditionSet`], drawn from those definitions with a seeded random
//! source. Derived variables are computed afterwards from the values
//! already resolved, in dependency order.
//!
//! ## Variable kinds
//!
//! - `fixed`: the same constant for every session
//! - `choice`: uniform pick from `values`
//! - `uniform`: real number in `[min, max)`
//! - `sequence`: `values[session_index % len]`, round-robin across a batch
//! - `derived`: arithmetic `formula` over other variables
//!
//! Definitions are validated once by [`ExperimentDesign::compile`]; any
//! configuration problem (including a cycle between derived variables) is
//! reported there, before a single session is drawn.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConditionError, FormulaError};
use crate::formula::{Formula, Number};

/// A realized value for one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ConditionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ConditionValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<bool> for ConditionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ConditionValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ConditionValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// How a variable obtains its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum VariableKind {
    Fixed,
    Choice,
    Uniform,
    Sequence,
    Derived,
}

impl VariableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Choice => "choice",
            Self::Uniform => "uniform",
            Self::Sequence => "sequence",
            Self::Derived => "derived",
        }
    }
}

impl FromStr for VariableKind {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "choice" => Ok(Self::Choice),
            "uniform" => Ok(Self::Uniform),
            "sequence" => Ok(Self::Sequence),
            "derived" => Ok(Self::Derived),
            other => Err(ConditionError::UnknownKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for VariableKind {
    type Error = ConditionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<VariableKind> for String {
    fn from(kind: VariableKind) -> Self {
        kind.as_str().to_string()
    }
}

/// One named experimental factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    #[serde(rename = "type")]
    pub kind: VariableKind,
    /// Constant for `fixed` (and an optional constant for `derived`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConditionValue>,
    /// Levels for `choice` and `sequence`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ConditionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Rounding granularity for `uniform` and `derived` results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_to: Option<f64>,
}

impl VariableDefinition {
    fn empty(kind: VariableKind) -> Self {
        Self {
            kind,
            value: None,
            values: Vec::new(),
            min: None,
            max: None,
            formula: None,
            round_to: None,
        }
    }

    pub fn fixed(value: impl Into<ConditionValue>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::empty(VariableKind::Fixed)
        }
    }

    pub fn choice<V: Into<ConditionValue>>(values: impl IntoIterator<Item = V>) -> Self {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            ..Self::empty(VariableKind::Choice)
        }
    }

    pub fn sequence<V: Into<ConditionValue>>(values: impl IntoIterator<Item = V>) -> Self {
        Self {
            values: values.into_iter().map(Into::into).collect(),
            ..Self::empty(VariableKind::Sequence)
        }
    }

    pub fn uniform(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            ..Self::empty(VariableKind::Uniform)
        }
    }

    pub fn derived(formula: &str) -> Self {
        Self {
            formula: Some(formula.to_string()),
            ..Self::empty(VariableKind::Derived)
        }
    }

    pub fn with_round_to(mut self, round_to: f64) -> Self {
        self.round_to = Some(round_to);
        self
    }
}

/// The realized value of every variable for one session or factorial cell.
///
/// Keys iterate in name order, so two equal sets serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionSet(BTreeMap<String, ConditionValue>);

impl ConditionSet {
    pub fn get(&self, name: &str) -> Option<&ConditionValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConditionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a copy with caller-supplied values for names already present.
    ///
    /// Names not in this set are ignored.
    pub fn with_overrides(&self, overrides: &BTreeMap<String, ConditionValue>) -> Self {
        let mut values = self.0.clone();
        for (name, value) in overrides {
            if let Some(slot) = values.get_mut(name) {
                *slot = value.clone();
            }
        }
        Self(values)
    }
}

impl FromIterator<(String, ConditionValue)> for ConditionSet {
    fn from_iter<I: IntoIterator<Item = (String, ConditionValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<ConditionSet> for BTreeMap<String, ConditionValue> {
    fn from(set: ConditionSet) -> Self {
        set.0
    }
}

#[derive(Debug, Clone)]
enum DerivedSource {
    Formula(Formula),
    Constant(ConditionValue),
}

#[derive(Debug, Clone)]
struct DerivedStep {
    name: String,
    source: DerivedSource,
    round_to: Option<f64>,
}

/// Validated variable definitions with derived variables in evaluation order.
#[derive(Debug, Clone)]
pub struct ExperimentDesign {
    definitions: BTreeMap<String, VariableDefinition>,
    derived: Vec<DerivedStep>,
}

impl ExperimentDesign {
    /// Validate definitions and order derived variables.
    ///
    /// Fails on any configuration error, including cycles among derived
    /// variables and formulas that reference undeclared names.
    pub fn compile(definitions: &BTreeMap<String, VariableDefinition>) -> Result<Self, ConditionError> {
        let mut formulas: BTreeMap<&str, DerivedSource> = BTreeMap::new();

        for (name, def) in definitions {
            validate(name, def)?;
            if def.kind != VariableKind::Derived {
                continue;
            }
            let source = match (&def.formula, &def.value) {
                (Some(text), _) => {
                    let formula =
                        Formula::parse(text).map_err(|e| ConditionError::formula(name, e))?;
                    if let Some(missing) = formula
                        .references()
                        .into_iter()
                        .find(|r| !definitions.contains_key(*r))
                    {
                        return Err(ConditionError::formula(
                            name,
                            FormulaError::UndefinedName(missing.to_string()),
                        ));
                    }
                    DerivedSource::Formula(formula)
                }
                (None, Some(value)) => DerivedSource::Constant(value.clone()),
                (None, None) => {
                    return Err(ConditionError::invalid(
                        name,
                        "derived variable needs a formula or a value",
                    ))
                }
            };
            formulas.insert(name.as_str(), source);
        }

        let order = dependency_order(&formulas)?;
        debug!(derived = ?order, "compiled experiment design");

        let derived = order
            .into_iter()
            .filter_map(|name| {
                let source = formulas.remove(name.as_str())?;
                let round_to = definitions.get(&name).and_then(|d| d.round_to);
                Some(DerivedStep {
                    name,
                    source,
                    round_to,
                })
            })
            .collect();

        Ok(Self {
            definitions: definitions.clone(),
            derived,
        })
    }

    pub fn definitions(&self) -> &BTreeMap<String, VariableDefinition> {
        &self.definitions
    }

    /// Names of derived variables in the order they are evaluated.
    pub fn derived_order(&self) -> Vec<&str> {
        self.derived.iter().map(|s| s.name.as_str()).collect()
    }

    /// Sample one condition set.
    ///
    /// The same generator state and `session_index` always give the same set.
    /// Non-derived variables consume randomness in name order.
    pub fn draw<R: Rng>(&self, session_index: usize, rng: &mut R) -> Result<ConditionSet, ConditionError> {
        let mut values = BTreeMap::new();

        for (name, def) in &self.definitions {
            let value = match def.kind {
                VariableKind::Fixed => def.value.clone(),
                VariableKind::Choice => {
                    let idx = rng.random_range(0..def.values.len());
                    def.values.get(idx).cloned()
                }
                VariableKind::Sequence => def.values.get(session_index % def.values.len()).cloned(),
                VariableKind::Uniform => {
                    let (min, max) = (def.min.unwrap_or(0.0), def.max.unwrap_or(0.0));
                    let raw = if min < max { rng.random_range(min..max) } else { min };
                    Some(round_value(raw, def.round_to))
                }
                VariableKind::Derived => None,
            };
            if let Some(value) = value {
                values.insert(name.clone(), value);
            }
        }

        self.resolve_derived(&mut values)?;
        Ok(ConditionSet(values))
    }

    /// Full cross product of every `choice` and `sequence` variable.
    ///
    /// Fixed values appear in every cell. Uniform variables are left out of
    /// every cell. Derived variables are computed per cell and never add cells.
    pub fn factorial(&self) -> Result<Vec<ConditionSet>, ConditionError> {
        let mut base = BTreeMap::new();
        let mut factors: Vec<(&str, &[ConditionValue])> = Vec::new();

        for (name, def) in &self.definitions {
            match def.kind {
                VariableKind::Fixed => {
                    if let Some(value) = &def.value {
                        base.insert(name.clone(), value.clone());
                    }
                }
                VariableKind::Choice | VariableKind::Sequence => {
                    factors.push((name.as_str(), def.values.as_slice()));
                }
                VariableKind::Uniform | VariableKind::Derived => {}
            }
        }

        let mut cells = vec![base];
        for (name, levels) in factors {
            cells = cells
                .into_iter()
                .flat_map(|cell| {
                    levels.iter().map(move |level| {
                        let mut next = cell.clone();
                        next.insert(name.to_string(), level.clone());
                        next
                    })
                })
                .collect();
        }

        cells
            .into_iter()
            .map(|mut cell| {
                self.resolve_derived(&mut cell)?;
                Ok(ConditionSet(cell))
            })
            .collect()
    }

    fn resolve_derived(&self, values: &mut BTreeMap<String, ConditionValue>) -> Result<(), ConditionError> {
        for step in &self.derived {
            let value = match &step.source {
                DerivedSource::Constant(value) => match (value, step.round_to) {
                    (ConditionValue::Int(i), Some(_)) => round_value(*i as f64, step.round_to),
                    (ConditionValue::Real(r), Some(_)) => round_value(*r, step.round_to),
                    (value, _) => value.clone(),
                },
                DerivedSource::Formula(formula) => {
                    let result = formula
                        .evaluate(values)
                        .map_err(|e| ConditionError::formula(&step.name, e))?;
                    match (result, step.round_to) {
                        (Number::Int(i), None) => ConditionValue::Int(i),
                        (Number::Real(r), None) => ConditionValue::Real(r),
                        (n, Some(_)) => {
                            let raw = match n {
                                Number::Int(i) => i as f64,
                                Number::Real(r) => r,
                            };
                            round_value(raw, step.round_to)
                        }
                    }
                }
            };
            values.insert(step.name.clone(), value);
        }
        Ok(())
    }
}

fn validate(name: &str, def: &VariableDefinition) -> Result<(), ConditionError> {
    if let Some(round_to) = def.round_to {
        if !(round_to.is_finite() && round_to > 0.0) {
            return Err(ConditionError::invalid(name, "round_to must be a positive number"));
        }
    }
    match def.kind {
        VariableKind::Fixed if def.value.is_none() => {
            Err(ConditionError::invalid(name, "fixed variable needs a value"))
        }
        VariableKind::Choice | VariableKind::Sequence if def.values.is_empty() => Err(
            ConditionError::invalid(name, format!("{} variable needs values", def.kind.as_str())),
        ),
        VariableKind::Uniform => match (def.min, def.max) {
            (Some(min), Some(max)) if min.is_finite() && max.is_finite() && min <= max => Ok(()),
            (Some(_), Some(_)) => Err(ConditionError::invalid(
                name,
                "uniform bounds must be finite with min <= max",
            )),
            _ => Err(ConditionError::invalid(name, "uniform variable needs min and max")),
        },
        _ => Ok(()),
    }
}

/// Kahn's algorithm over derived variables; ties break by name.
fn dependency_order(formulas: &BTreeMap<&str, DerivedSource>) -> Result<Vec<String>, ConditionError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (&name, source) in formulas {
        let deps: BTreeSet<&str> = match source {
            DerivedSource::Formula(f) => f
                .references()
                .into_iter()
                .filter(|r| formulas.contains_key(r))
                .collect(),
            DerivedSource::Constant(_) => BTreeSet::new(),
        };
        in_degree.insert(name, deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(name);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|&(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    let mut order = Vec::with_capacity(formulas.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        for &dependent in dependents.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != formulas.len() {
        let names = in_degree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(n, _)| n.to_string())
            .collect();
        return Err(ConditionError::CyclicDependency { names });
    }
    Ok(order)
}

/// Round to the nearest multiple of `round_to`, ties to even.
///
/// With `round_to >= 1` a whole-number result becomes an integer.
fn round_value(raw: f64, round_to: Option<f64>) -> ConditionValue {
    let Some(step) = round_to else {
        return ConditionValue::Real(raw);
    };
    let rounded = (raw / step).round_ties_even() * step;
    if step >= 1.0 && rounded.fract() == 0.0 && rounded.abs() < i64::MAX as f64 {
        ConditionValue::Int(rounded as i64)
    } else {
        ConditionValue::Real(rounded)
    }
}

/// Compile `definitions` and draw one condition set.
pub fn draw<R: Rng>(
    definitions: &BTreeMap<String, VariableDefinition>,
    session_index: usize,
    rng: &mut R,
) -> Result<ConditionSet, ConditionError> {
    ExperimentDesign::compile(definitions)?.draw(session_index, rng)
}

/// Compile `definitions` and enumerate the full factorial design.
pub fn factorial(definitions: &BTreeMap<String, VariableDefinition>) -> Result<Vec<ConditionSet>, ConditionError> {
    ExperimentDesign::compile(definitions)?.factorial()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn defs(pairs: Vec<(&str, VariableDefinition)>) -> BTreeMap<String, VariableDefinition> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_draw_is_deterministic() {
        let variables = defs(vec![
            ("val", VariableDefinition::choice([1i64, 2, 3, 4, 5])),
            ("price", VariableDefinition::uniform(0.0, 100.0)),
            ("arm", VariableDefinition::sequence(["a", "b"])),
        ]);
        let draws_a: Vec<_> = (0..10)
            .map(|i| draw(&variables, i, &mut ChaCha8Rng::seed_from_u64(42)).unwrap())
            .collect();
        let draws_b: Vec<_> = (0..10)
            .map(|i| draw(&variables, i, &mut ChaCha8Rng::seed_from_u64(42)).unwrap())
            .collect();
        assert_eq!(draws_a, draws_b);
        assert_eq!(
            serde_json::to_string(&draws_a).unwrap(),
            serde_json::to_string(&draws_b).unwrap()
        );
    }

    #[test]
    fn test_sequence_round_robin() {
        let variables = defs(vec![("t", VariableDefinition::sequence(["A", "B", "C"]))]);
        let design = ExperimentDesign::compile(&variables).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let got: Vec<String> = (0..5)
            .map(|i| design.draw(i, &mut rng).unwrap().get("t").unwrap().to_string())
            .collect();
        assert_eq!(got, vec!["A", "B", "C", "A", "B"]);
    }

    #[test]
    fn test_choice_and_uniform_ranges() {
        let variables = defs(vec![
            ("color", VariableDefinition::choice(["red", "blue", "green"])),
            ("price", VariableDefinition::uniform(1.0, 10.0)),
        ]);
        let design = ExperimentDesign::compile(&variables).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for i in 0..50 {
            let set = design.draw(i, &mut rng).unwrap();
            let color = set.get("color").unwrap().to_string();
            assert!(["red", "blue", "green"].contains(&color.as_str()));
            match set.get("price") {
                Some(ConditionValue::Real(p)) => assert!((1.0..10.0).contains(p)),
                other => panic!("unexpected price {other:?}"),
            }
        }
    }

    #[test]
    fn test_uniform_round_to_integer() {
        let variables = defs(vec![(
            "budget",
            VariableDefinition::uniform(10.0, 100.0).with_round_to(5.0),
        )]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let set = draw(&variables, 0, &mut rng).unwrap();
        match set.get("budget") {
            Some(ConditionValue::Int(v)) => assert_eq!(v % 5, 0),
            other => panic!("expected integer, got {other:?}"),
        }
    }

    #[test]
    fn test_derived_order_independent_of_declaration() {
        let variables = defs(vec![
            ("z", VariableDefinition::derived("y + 5")),
            ("y", VariableDefinition::derived("x * 2")),
            ("x", VariableDefinition::fixed(10i64)),
        ]);
        let design = ExperimentDesign::compile(&variables).unwrap();
        assert_eq!(design.derived_order(), vec!["y", "z"]);
        let set = design.draw(0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(set.get("y"), Some(&ConditionValue::Int(20)));
        assert_eq!(set.get("z"), Some(&ConditionValue::Int(25)));
    }

    #[test]
    fn test_derived_ties_break_by_name() {
        let variables = defs(vec![
            ("base", VariableDefinition::fixed(1i64)),
            ("c", VariableDefinition::derived("base")),
            ("a", VariableDefinition::derived("base")),
            ("b", VariableDefinition::derived("a + c")),
        ]);
        let design = ExperimentDesign::compile(&variables).unwrap();
        assert_eq!(design.derived_order(), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_cycle_is_configuration_error() {
        let variables = defs(vec![
            ("a", VariableDefinition::derived("b + 1")),
            ("b", VariableDefinition::derived("a + 1")),
        ]);
        let err = ExperimentDesign::compile(&variables).unwrap_err();
        assert_eq!(
            err,
            ConditionError::CyclicDependency {
                names: vec!["a".to_string(), "b".to_string()]
            }
        );
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let variables = defs(vec![("a", VariableDefinition::derived("a + 1"))]);
        assert!(matches!(
            ExperimentDesign::compile(&variables),
            Err(ConditionError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_derived_round_to() {
        let variables = defs(vec![
            ("v", VariableDefinition::fixed(7.3)),
            ("half", VariableDefinition::derived("v / 2").with_round_to(0.5)),
            ("whole", VariableDefinition::derived("v * 3").with_round_to(1.0)),
        ]);
        let set = draw(&variables, 0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(set.get("half"), Some(&ConditionValue::Real(3.5)));
        assert_eq!(set.get("whole"), Some(&ConditionValue::Int(22)));
    }

    #[test]
    fn test_name_prefix_is_not_a_reference() {
        // "x" appears inside "max" and "x_cap" but only x_cap is referenced.
        let variables = defs(vec![
            ("x_cap", VariableDefinition::fixed(4i64)),
            ("x", VariableDefinition::derived("max(x_cap, 1)")),
        ]);
        let set = draw(&variables, 0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(set.get("x"), Some(&ConditionValue::Int(4)));
    }

    #[test]
    fn test_derived_constant_value() {
        let mut constant = VariableDefinition::derived("unused");
        constant.formula = None;
        constant.value = Some(ConditionValue::Int(3));
        let variables = defs(vec![("k", constant)]);
        let set = draw(&variables, 0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(set.get("k"), Some(&ConditionValue::Int(3)));
    }

    #[test]
    fn test_derived_constant_honors_round_to() {
        let constant = |value: ConditionValue, round_to: f64| {
            let mut def = VariableDefinition::derived("unused").with_round_to(round_to);
            def.formula = None;
            def.value = Some(value);
            def
        };
        let variables = defs(vec![
            ("half", constant(ConditionValue::Real(3.3), 0.5)),
            ("tens", constant(ConditionValue::Int(47), 10.0)),
            ("label", constant(ConditionValue::from("x"), 1.0)),
        ]);
        let set = draw(&variables, 0, &mut ChaCha8Rng::seed_from_u64(0)).unwrap();
        assert_eq!(set.get("half"), Some(&ConditionValue::Real(3.5)));
        assert_eq!(set.get("tens"), Some(&ConditionValue::Int(50)));
        assert_eq!(set.get("label"), Some(&ConditionValue::from("x")));
    }

    #[test]
    fn test_invalid_definitions() {
        let mut no_formula = VariableDefinition::derived("1");
        no_formula.formula = None;
        let cases = vec![
            ("d", no_formula),
            ("c", VariableDefinition::choice(Vec::<i64>::new())),
            ("u", VariableDefinition::uniform(5.0, 1.0)),
            ("r", VariableDefinition::uniform(0.0, 1.0).with_round_to(0.0)),
        ];
        for (name, def) in cases {
            let variables = defs(vec![(name, def)]);
            assert!(matches!(
                ExperimentDesign::compile(&variables),
                Err(ConditionError::InvalidDefinition { .. })
            ));
        }
    }

    #[test]
    fn test_undefined_reference_names_variable() {
        let variables = defs(vec![("y", VariableDefinition::derived("ghost * 2"))]);
        let err = ExperimentDesign::compile(&variables).unwrap_err();
        assert_eq!(
            err,
            ConditionError::Formula {
                variable: "y".to_string(),
                source: FormulaError::UndefinedName("ghost".to_string()),
            }
        );
    }

    #[test]
    fn test_unknown_kind_from_json() {
        let parsed: Result<VariableDefinition, _> =
            serde_json::from_str(r#"{"type": "gaussian", "min": 0, "max": 1}"#);
        let err = parsed.unwrap_err().to_string();
        assert!(err.contains("unknown variable kind 'gaussian'"), "{err}");

        let ok: VariableDefinition =
            serde_json::from_str(r#"{"type": "choice", "values": [1, 2.5, "x"]}"#).unwrap();
        assert_eq!(ok.kind, VariableKind::Choice);
        assert_eq!(
            ok.values,
            vec![
                ConditionValue::Int(1),
                ConditionValue::Real(2.5),
                ConditionValue::Text("x".to_string())
            ]
        );
    }

    #[test]
    fn test_factorial_completeness() {
        let variables = defs(vec![
            ("color", VariableDefinition::choice(["red", "blue"])),
            ("size", VariableDefinition::choice(["S", "M", "L"])),
            ("constant", VariableDefinition::fixed(42i64)),
        ]);
        let cells = factorial(&variables).unwrap();
        assert_eq!(cells.len(), 6);
        let mut pairs = BTreeSet::new();
        for cell in &cells {
            assert_eq!(cell.get("constant"), Some(&ConditionValue::Int(42)));
            pairs.insert((
                cell.get("color").unwrap().to_string(),
                cell.get("size").unwrap().to_string(),
            ));
        }
        let expected: BTreeSet<(String, String)> = ["red", "blue"]
            .iter()
            .flat_map(|c| ["S", "M", "L"].iter().map(move |s| (c.to_string(), s.to_string())))
            .collect();
        assert_eq!(pairs, expected);
    }

    #[test]
    fn test_factorial_skips_uniform_and_derives_per_cell() {
        let variables = defs(vec![
            ("price", VariableDefinition::uniform(0.0, 1.0)),
            ("arm", VariableDefinition::sequence([1i64, 2])),
            ("doubled", VariableDefinition::derived("arm * 2")),
        ]);
        let cells = factorial(&variables).unwrap();
        assert_eq!(cells.len(), 2);
        for cell in &cells {
            assert!(!cell.contains("price"));
            let arm = match cell.get("arm") {
                Some(ConditionValue::Int(a)) => *a,
                other => panic!("unexpected {other:?}"),
            };
            assert_eq!(cell.get("doubled"), Some(&ConditionValue::Int(arm * 2)));
        }
    }

    #[test]
    fn test_factorial_without_factors() {
        let cells = factorial(&BTreeMap::new()).unwrap();
        assert_eq!(cells, vec![ConditionSet::default()]);

        let variables = defs(vec![("x", VariableDefinition::fixed(1i64))]);
        let cells = factorial(&variables).unwrap();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].get("x"), Some(&ConditionValue::Int(1)));
    }

    #[test]
    fn test_overrides_only_touch_known_names() {
        let set: ConditionSet = [("a".to_string(), ConditionValue::Int(1))].into_iter().collect();
        let overrides: BTreeMap<String, ConditionValue> = [
            ("a".to_string(), ConditionValue::Int(9)),
            ("b".to_string(), ConditionValue::Int(2)),
        ]
        .into_iter()
        .collect();
        let merged = set.with_overrides(&overrides);
        assert_eq!(merged.get("a"), Some(&ConditionValue::Int(9)));
        assert!(!merged.contains("b"));
        assert_eq!(set.get("a"), Some(&ConditionValue::Int(1)));
    }
}
