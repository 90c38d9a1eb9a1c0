//! Search space definitions.
//!
//! A space is written as an ordinary JSON tree in which search variables are
//! tagged lists:
//!
//! ```text
//! ["hp_choice",     name, [option, ...]]
//! ["hp_uniform",    name, low, high]
//! ["hp_loguniform", name, low, high]
//! ["hp_quniform",   name, low, high, q]
//! ["hp_randint",    name, low, high]
//! ```
//!
//! The tree is parsed once into [`SpaceNode`]s; everything downstream works on
//! the typed form. Choice options may themselves contain variables, which are
//! only active when that option is picked.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use gt_types::{validation_error, GtResult, Suggestion};

/// Values picked for the active variables of one suggestion, keyed by
/// variable name. Choices record the option index.
pub type Point = BTreeMap<String, Value>;

/// How a variable is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Distribution {
    Choice { options: Vec<SpaceNode> },
    /// Continuous uniform range [low, high].
    Uniform { low: f64, high: f64 },
    /// Sampled uniformly in log-space then exponentiated.
    LogUniform { low: f64, high: f64 },
    /// Uniform, rounded to a multiple of `q`.
    QUniform { low: f64, high: f64, q: f64 },
    /// Integer range [low, high] inclusive.
    RandInt { low: i64, high: i64 },
}

/// A named search dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchVariable {
    pub name: String,
    pub distribution: Distribution,
}

/// One node of a parsed space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SpaceNode {
    Literal(Value),
    Map(BTreeMap<String, SpaceNode>),
    List(Vec<SpaceNode>),
    Variable(SearchVariable),
}

/// A parsed search space.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    root: SpaceNode,
    names: Vec<String>,
}

impl SearchSpace {
    /// Parse a JSON tree with embedded `hp_*` markers.
    pub fn parse(value: &Value) -> GtResult<Self> {
        let mut names = Vec::new();
        let mut seen = BTreeSet::new();
        let root = parse_node(value, "", &mut names, &mut seen)?;
        Ok(Self { root, names })
    }

    pub fn root(&self) -> &SpaceNode {
        &self.root
    }

    /// Variable names in document order.
    pub fn variables(&self) -> &[String] {
        &self.names
    }

    /// Draw an independent random suggestion.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> (Suggestion, Point) {
        self.realize(&mut |var: &SearchVariable| var.distribution.sample(&mut *rng))
    }

    /// Draw a suggestion near `base`: variables present in `base` are nudged,
    /// newly activated ones are sampled fresh.
    pub fn perturb<R: Rng>(&self, base: &Point, rng: &mut R) -> (Suggestion, Point) {
        self.realize(&mut |var: &SearchVariable| match base.get(&var.name) {
            Some(current) => var.distribution.perturb(current, &mut *rng),
            None => var.distribution.sample(&mut *rng),
        })
    }

    /// The grid point at `index`, first dimension varying slowest, or `None`
    /// past the end. Continuous dimensions contribute `steps` evenly spaced
    /// points; choices contribute the grid of each option in turn.
    pub fn grid_point(&self, steps: usize, index: usize) -> Option<Suggestion> {
        grid_node(&self.root, steps, index).map(Suggestion::new)
    }

    /// Every grid point in order. Only sensible for small spaces; large grids
    /// are walked with [`SearchSpace::grid_point`].
    pub fn enumerate(&self, steps: usize) -> Vec<Suggestion> {
        (0..self.grid_size(steps).unwrap_or(0))
            .map_while(|index| self.grid_point(steps, index))
            .collect()
    }

    /// Number of grid points, or `None` on overflow.
    pub fn grid_size(&self, steps: usize) -> Option<usize> {
        grid_size_node(&self.root, steps)
    }

    fn realize(&self, pick: &mut dyn FnMut(&SearchVariable) -> Value) -> (Suggestion, Point) {
        let mut point = Point::new();
        let value = realize_node(&self.root, pick, &mut point);
        (Suggestion::new(value), point)
    }
}

fn parse_node(
    value: &Value,
    path: &str,
    names: &mut Vec<String>,
    seen: &mut BTreeSet<String>,
) -> GtResult<SpaceNode> {
    match value {
        Value::Array(items) => match items.first().and_then(Value::as_str) {
            Some(tag) if tag.starts_with("hp_") => {
                let variable = parse_variable(tag, items, path, names, seen)?;
                Ok(SpaceNode::Variable(variable))
            }
            _ => {
                let children = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| parse_node(item, &format!("{path}/{i}"), names, seen))
                    .collect::<GtResult<Vec<_>>>()?;
                if children.iter().all(|c| matches!(c, SpaceNode::Literal(_))) {
                    Ok(SpaceNode::Literal(value.clone()))
                } else {
                    Ok(SpaceNode::List(children))
                }
            }
        },
        Value::Object(map) => {
            let mut children = BTreeMap::new();
            for (key, item) in map {
                children.insert(
                    key.clone(),
                    parse_node(item, &format!("{path}/{key}"), names, seen)?,
                );
            }
            if children.values().all(|c| matches!(c, SpaceNode::Literal(_))) {
                Ok(SpaceNode::Literal(value.clone()))
            } else {
                Ok(SpaceNode::Map(children))
            }
        }
        other => Ok(SpaceNode::Literal(other.clone())),
    }
}

fn parse_variable(
    tag: &str,
    items: &[Value],
    path: &str,
    names: &mut Vec<String>,
    seen: &mut BTreeSet<String>,
) -> GtResult<SearchVariable> {
    let location = if path.is_empty() { "/" } else { path };
    let expect_arity = |n: usize| {
        if items.len() == n {
            Ok(())
        } else {
            Err(validation_error!(
                "{tag} at {location} takes {} arguments, got {}",
                n - 1,
                items.len() - 1
            ))
        }
    };
    let number = |i: usize| {
        items[i].as_f64().ok_or_else(|| {
            validation_error!("{tag} at {location}: argument {i} must be a number")
        })
    };
    let ordered = |low: f64, high: f64| {
        if low > high {
            Err(validation_error!("{tag} at {location}: low {low} exceeds high {high}"))
        } else if !(high - low).is_finite() {
            Err(validation_error!("{tag} at {location}: range {low}..{high} is too wide"))
        } else {
            Ok(())
        }
    };

    let name = items
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| validation_error!("{tag} at {location}: missing variable name"))?
        .to_string();
    if !seen.insert(name.clone()) {
        return Err(validation_error!("duplicate search variable name {name}"));
    }
    names.push(name.clone());

    let distribution = match tag {
        "hp_choice" => {
            expect_arity(3)?;
            let raw = items[2].as_array().ok_or_else(|| {
                validation_error!("hp_choice {name}: options must be a list")
            })?;
            if raw.is_empty() {
                return Err(validation_error!("hp_choice {name}: needs at least one option"));
            }
            let options = raw
                .iter()
                .enumerate()
                .map(|(i, option)| {
                    parse_node(option, &format!("{path}/{name}[{i}]"), names, seen)
                })
                .collect::<GtResult<Vec<_>>>()?;
            Distribution::Choice { options }
        }
        "hp_uniform" => {
            expect_arity(4)?;
            let (low, high) = (number(2)?, number(3)?);
            ordered(low, high)?;
            Distribution::Uniform { low, high }
        }
        "hp_loguniform" => {
            expect_arity(4)?;
            let (low, high) = (number(2)?, number(3)?);
            ordered(low, high)?;
            if low <= 0.0 {
                return Err(validation_error!("hp_loguniform {name}: bounds must be positive"));
            }
            Distribution::LogUniform { low, high }
        }
        "hp_quniform" => {
            expect_arity(5)?;
            let (low, high, q) = (number(2)?, number(3)?, number(4)?);
            ordered(low, high)?;
            if q <= 0.0 {
                return Err(validation_error!("hp_quniform {name}: q must be positive"));
            }
            Distribution::QUniform { low, high, q }
        }
        "hp_randint" => {
            expect_arity(4)?;
            let low = items[2].as_i64();
            let high = items[3].as_i64();
            let (Some(low), Some(high)) = (low, high) else {
                return Err(validation_error!("hp_randint {name}: bounds must be integers"));
            };
            if low > high {
                return Err(validation_error!("hp_randint {name}: low {low} exceeds high {high}"));
            }
            Distribution::RandInt { low, high }
        }
        other => return Err(validation_error!("unknown search marker {other} at {location}")),
    };

    Ok(SearchVariable { name, distribution })
}

impl Distribution {
    /// Raw draw: the value itself, or the option index for a choice.
    fn sample<R: Rng>(&self, rng: &mut R) -> Value {
        match self {
            Self::Choice { options } => Value::from(rng.gen_range(0..options.len())),
            Self::Uniform { low, high } => Value::from(rng.gen_range(*low..=*high)),
            Self::LogUniform { low, high } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                Value::from(log_val.exp().clamp(*low, *high))
            }
            Self::QUniform { low, high, q } => {
                let raw: f64 = rng.gen_range(*low..=*high);
                Value::from(quantize(raw, *q))
            }
            Self::RandInt { low, high } => Value::from(rng.gen_range(*low..=*high)),
        }
    }

    fn perturb<R: Rng>(&self, current: &Value, rng: &mut R) -> Value {
        match (self, current.as_f64()) {
            (Self::Choice { options }, Some(_)) => {
                // Mostly keep the branch so nested variables get refined.
                if rng.gen::<f64>() < 0.8 {
                    current.clone()
                } else {
                    Value::from(rng.gen_range(0..options.len()))
                }
            }
            (Self::Uniform { low, high }, Some(v)) => {
                let noise = rng.gen_range(-0.1..0.1) * (high - low);
                Value::from((v + noise).clamp(*low, *high))
            }
            (Self::LogUniform { low, high }, Some(v)) if v > 0.0 => {
                let noise = rng.gen_range(-0.1..0.1) * (high.ln() - low.ln());
                Value::from((v.ln() + noise).exp().clamp(*low, *high))
            }
            (Self::QUniform { low, high, q }, Some(v)) => {
                let noise = rng.gen_range(-0.1..0.1) * (high - low);
                Value::from(quantize((v + noise).clamp(*low, *high), *q))
            }
            (Self::RandInt { low, high }, Some(_)) => {
                let v = current.as_i64().unwrap_or(*low);
                let delta: i64 = rng.gen_range(-2..=2);
                Value::from(v.saturating_add(delta).clamp(*low, *high))
            }
            _ => self.sample(rng),
        }
    }

    /// Number of grid points of a non-choice dimension, or `None` on overflow.
    fn grid_len(&self, steps: usize) -> Option<usize> {
        match self {
            Self::Choice { .. } => None,
            Self::Uniform { low, high } | Self::LogUniform { low, high } => {
                Some(if low == high { 1 } else { steps.max(2) })
            }
            Self::QUniform { low, high, q } => {
                let (first, last) = ((low / q).ceil(), (high / q).floor());
                if first > last {
                    return Some(1);
                }
                let count = last - first + 1.0;
                (count < usize::MAX as f64).then_some(count as usize)
            }
            Self::RandInt { low, high } => {
                usize::try_from(i128::from(*high) - i128::from(*low) + 1).ok()
            }
        }
    }

    /// The `index`-th grid value of a non-choice dimension.
    fn grid_value(&self, steps: usize, index: usize) -> Value {
        let fraction = |steps: usize| index as f64 / (steps.max(2) - 1) as f64;
        match self {
            Self::Choice { .. } => Value::from(index),
            Self::Uniform { low, high } if low == high => Value::from(*low),
            Self::Uniform { low, high } => {
                Value::from((low + fraction(steps) * (high - low)).clamp(*low, *high))
            }
            Self::LogUniform { low, high } if low == high => Value::from(*low),
            Self::LogUniform { low, high } => {
                let log = low.ln() + fraction(steps) * (high.ln() - low.ln());
                Value::from(log.exp().clamp(*low, *high))
            }
            Self::QUniform { low, high, q } => {
                let (first, last) = ((low / q).ceil(), (high / q).floor());
                if first > last {
                    Value::from(quantize(*low, *q))
                } else {
                    Value::from((first + index as f64) * q)
                }
            }
            Self::RandInt { low, .. } => {
                Value::from((i128::from(*low) + index as i128) as i64)
            }
        }
    }
}

fn quantize(value: f64, q: f64) -> f64 {
    (value / q).round() * q
}

fn realize_node(
    node: &SpaceNode,
    pick: &mut dyn FnMut(&SearchVariable) -> Value,
    point: &mut Point,
) -> Value {
    match node {
        SpaceNode::Literal(value) => value.clone(),
        SpaceNode::Map(children) => {
            let mut map = Map::new();
            for (key, child) in children {
                map.insert(key.clone(), realize_node(child, pick, point));
            }
            Value::Object(map)
        }
        SpaceNode::List(children) => Value::Array(
            children
                .iter()
                .map(|child| realize_node(child, pick, point))
                .collect(),
        ),
        SpaceNode::Variable(var) => {
            let raw = pick(var);
            point.insert(var.name.clone(), raw.clone());
            match &var.distribution {
                Distribution::Choice { options } => {
                    let index = raw
                        .as_u64()
                        .and_then(|i| usize::try_from(i).ok())
                        .unwrap_or(0)
                        .min(options.len() - 1);
                    realize_node(&options[index], pick, point)
                }
                _ => raw,
            }
        }
    }
}

fn grid_node(node: &SpaceNode, steps: usize, index: usize) -> Option<Value> {
    match node {
        SpaceNode::Literal(value) => (index == 0).then(|| value.clone()),
        SpaceNode::Map(children) => {
            let mut rest = index;
            let mut map = Map::new();
            for (key, child) in children.iter().rev() {
                let size = grid_size_node(child, steps)?;
                map.insert(key.clone(), grid_node(child, steps, rest % size)?);
                rest /= size;
            }
            (rest == 0).then_some(Value::Object(map))
        }
        SpaceNode::List(children) => {
            let mut rest = index;
            let mut items = Vec::with_capacity(children.len());
            for child in children.iter().rev() {
                let size = grid_size_node(child, steps)?;
                items.push(grid_node(child, steps, rest % size)?);
                rest /= size;
            }
            items.reverse();
            (rest == 0).then_some(Value::Array(items))
        }
        SpaceNode::Variable(var) => match &var.distribution {
            Distribution::Choice { options } => {
                let mut rest = index;
                for option in options {
                    let size = grid_size_node(option, steps)?;
                    if rest < size {
                        return grid_node(option, steps, rest);
                    }
                    rest -= size;
                }
                None
            }
            other => (index < other.grid_len(steps)?).then(|| other.grid_value(steps, index)),
        },
    }
}

fn grid_size_node(node: &SpaceNode, steps: usize) -> Option<usize> {
    match node {
        SpaceNode::Literal(_) => Some(1),
        SpaceNode::Map(children) => children
            .values()
            .try_fold(1usize, |acc, child| acc.checked_mul(grid_size_node(child, steps)?)),
        SpaceNode::List(children) => children
            .iter()
            .try_fold(1usize, |acc, child| acc.checked_mul(grid_size_node(child, steps)?)),
        SpaceNode::Variable(var) => match &var.distribution {
            Distribution::Choice { options } => options
                .iter()
                .try_fold(0usize, |acc, option| acc.checked_add(grid_size_node(option, steps)?)),
            other => other.grid_len(steps),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use serde_json::json;

    fn model_space() -> Value {
        json!({
            "model": ["hp_choice", "model", [
                {"kind": "krr", "alpha": ["hp_loguniform", "alpha", 1e-6, 1.0]},
                {"kind": "linear"}
            ]],
            "cutoff": ["hp_quniform", "cutoff", 2.0, 6.0, 0.5],
            "depth": ["hp_randint", "depth", 1, 4],
            "fixed": [1, 2, 3]
        })
    }

    #[test]
    fn parse_collects_variables() {
        let space = SearchSpace::parse(&model_space()).unwrap();
        assert_eq!(space.variables(), &["cutoff", "depth", "model", "alpha"]);
        match space.root() {
            SpaceNode::Map(children) => {
                assert!(matches!(children["fixed"], SpaceNode::Literal(_)));
                assert!(matches!(children["model"], SpaceNode::Variable(_)));
            }
            other => panic!("unexpected root: {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_malformed_markers() {
        for bad in [
            json!(["hp_uniform", "x", 1.0]),
            json!(["hp_uniform", "x", 2.0, 1.0]),
            json!(["hp_loguniform", "x", 0.0, 1.0]),
            json!(["hp_quniform", "x", 0.0, 1.0, 0.0]),
            json!(["hp_randint", "x", 0.5, 3]),
            json!(["hp_choice", "x", []]),
            json!(["hp_normal", "x", 0.0, 1.0]),
            json!({"a": ["hp_randint", "x", 0, 1], "b": ["hp_randint", "x", 0, 1]}),
        ] {
            assert!(SearchSpace::parse(&bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn plain_lists_stay_literal() {
        let space = SearchSpace::parse(&json!({"layers": [64, "relu"]})).unwrap();
        assert!(space.variables().is_empty());
        assert_eq!(space.enumerate(3), vec![Suggestion::new(json!({"layers": [64, "relu"]}))]);
    }

    #[test]
    fn samples_respect_bounds() {
        let space = SearchSpace::parse(&model_space()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..200 {
            let (suggestion, point) = space.sample(&mut rng);
            let cutoff = suggestion.pointer("/cutoff").and_then(Value::as_f64).unwrap();
            assert!((2.0..=6.0).contains(&cutoff));
            assert_eq!((cutoff / 0.5).fract(), 0.0);
            let depth = suggestion.pointer("/depth").and_then(Value::as_i64).unwrap();
            assert!((1..=4).contains(&depth));
            match suggestion.pointer("/model/kind").and_then(Value::as_str) {
                Some("krr") => {
                    let alpha = suggestion.pointer("/model/alpha").and_then(Value::as_f64).unwrap();
                    assert!((1e-6..=1.0).contains(&alpha));
                    assert!(point.contains_key("alpha"));
                }
                Some("linear") => assert!(!point.contains_key("alpha")),
                other => panic!("unexpected model kind: {other:?}"),
            }
        }
    }

    #[test]
    fn sampling_is_seed_deterministic() {
        let space = SearchSpace::parse(&model_space()).unwrap();
        let mut a = ChaCha8Rng::seed_from_u64(42);
        let mut b = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..20 {
            assert_eq!(space.sample(&mut a).0, space.sample(&mut b).0);
        }
    }

    #[test]
    fn perturb_stays_in_bounds() {
        let space = SearchSpace::parse(&json!({
            "lr": ["hp_loguniform", "lr", 1e-5, 1e-1],
            "n": ["hp_randint", "n", 0, 3]
        }))
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let (_, base) = space.sample(&mut rng);
        for _ in 0..100 {
            let (suggestion, _) = space.perturb(&base, &mut rng);
            let lr = suggestion.pointer("/lr").and_then(Value::as_f64).unwrap();
            assert!((1e-5..=1e-1).contains(&lr), "lr out of bounds: {lr}");
            let n = suggestion.pointer("/n").and_then(Value::as_i64).unwrap();
            assert!((0..=3).contains(&n));
        }
    }

    #[test]
    fn enumerate_matches_grid_size() {
        let space = SearchSpace::parse(&model_space()).unwrap();
        // cutoff: 9 points, depth: 4, model: 3 alphas + 1 linear
        assert_eq!(space.grid_size(3), Some(9 * 4 * 4));
        let grid = space.enumerate(3);
        assert_eq!(grid.len(), 9 * 4 * 4);
        let unique: BTreeSet<String> = grid.iter().map(|s| s.to_string()).collect();
        assert_eq!(unique.len(), grid.len());
    }

    #[test]
    fn enumerate_first_dimension_slowest() {
        let space = SearchSpace::parse(&json!({
            "a": ["hp_choice", "a", [1, 2]],
            "b": ["hp_choice", "b", ["x", "y"]]
        }))
        .unwrap();
        let grid: Vec<Value> = space.enumerate(2).into_iter().map(Suggestion::into_value).collect();
        assert_eq!(
            grid,
            vec![
                json!({"a": 1, "b": "x"}),
                json!({"a": 1, "b": "y"}),
                json!({"a": 2, "b": "x"}),
                json!({"a": 2, "b": "y"}),
            ]
        );
    }

    #[test]
    fn grid_points_are_computed_on_demand() {
        // 10^12 points: far too many to hold, cheap to index.
        let mut dims = serde_json::Map::new();
        for i in 0..12 {
            dims.insert(format!("w{i}"), json!(["hp_uniform", format!("w{i}"), 0.0, 1.0]));
        }
        let space = SearchSpace::parse(&Value::Object(dims)).unwrap();
        let size = space.grid_size(10).unwrap();
        assert_eq!(size, 1_000_000_000_000);

        let last = space.grid_point(10, size - 1).unwrap();
        assert_eq!(last.pointer("/w0").and_then(Value::as_f64), Some(1.0));
        assert_eq!(last.pointer("/w11").and_then(Value::as_f64), Some(1.0));
        let second = space.grid_point(10, 1).unwrap();
        assert_eq!(second.pointer("/w0").and_then(Value::as_f64), Some(0.0));
        assert!(space.grid_point(10, size).is_none());
    }

    #[test]
    fn wide_integer_range_is_indexable() {
        let full = SearchSpace::parse(&json!({"n": ["hp_randint", "n", i64::MIN, i64::MAX]}))
            .unwrap();
        assert_eq!(full.grid_size(5), None);
        let near_max = SearchSpace::parse(&json!({"n": ["hp_randint", "n", i64::MAX - 1, i64::MAX]}))
            .unwrap();
        assert_eq!(near_max.grid_size(5), Some(2));
        assert_eq!(
            near_max.grid_point(5, 1).unwrap().pointer("/n").and_then(Value::as_i64),
            Some(i64::MAX)
        );
    }

    #[test]
    fn overflowing_ranges_are_rejected() {
        for bad in [
            json!(["hp_uniform", "x", -1e308, 1e308]),
            json!(["hp_quniform", "x", -1e308, 1e308, 1.0]),
        ] {
            assert!(SearchSpace::parse(&bad).is_err(), "accepted {bad}");
        }
    }

    #[test]
    fn integer_perturb_saturates_at_the_bound() {
        let space = SearchSpace::parse(&json!({
            "n": ["hp_randint", "n", i64::MAX - 3, i64::MAX]
        }))
        .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut base = Point::new();
        base.insert("n".into(), json!(i64::MAX));
        for _ in 0..50 {
            let (suggestion, _) = space.perturb(&base, &mut rng);
            let n = suggestion.pointer("/n").and_then(Value::as_i64).unwrap();
            assert!(n >= i64::MAX - 3);
        }
    }
}
