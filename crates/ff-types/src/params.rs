//! Material coefficient layout, validated parameter vectors and cache keys.
//!
//! Coefficients come in numbered pairs: a strictly positive magnitude `c{i}`
//! and an exponent `m{i}`. Magnitudes span many decades, so the optimizer sees
//! them in log10 space while exponents are searched linearly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::errors::FitResult;
use crate::invalid_argument;

/// Role of a coefficient inside its pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientKind {
    /// Positive scale factor, searched in log10 space.
    Magnitude,
    /// Unconstrained-sign exponent, searched linearly.
    Exponent,
}

/// A single named material coefficient with its admissible range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientDef {
    pub name: String,
    /// Pair index, 1-based.
    pub pair: usize,
    pub kind: CoefficientKind,
    pub low: f64,
    pub high: f64,
    pub initial: f64,
    /// Optimized when `true`, held at `initial` otherwise.
    pub active: bool,
}

impl CoefficientDef {
    pub fn magnitude(pair: usize, low: f64, high: f64, initial: f64) -> Self {
        Self {
            name: format!("c{pair}"),
            pair,
            kind: CoefficientKind::Magnitude,
            low,
            high,
            initial,
            active: true,
        }
    }

    pub fn exponent(pair: usize, low: f64, high: f64, initial: f64) -> Self {
        Self {
            name: format!("m{pair}"),
            pair,
            kind: CoefficientKind::Exponent,
            low,
            high,
            initial,
            active: true,
        }
    }

    pub fn fixed(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.low, self.high)
    }

    /// Bounds in the optimizer's coordinate system.
    pub fn search_bounds(&self) -> (f64, f64) {
        match self.kind {
            CoefficientKind::Magnitude => (self.low.log10(), self.high.log10()),
            CoefficientKind::Exponent => (self.low, self.high),
        }
    }

    pub fn to_search(&self, value: f64) -> f64 {
        match self.kind {
            CoefficientKind::Magnitude => self.clamp(value).log10(),
            CoefficientKind::Exponent => self.clamp(value),
        }
    }

    pub fn from_search(&self, x: f64) -> f64 {
        let (lo, hi) = self.search_bounds();
        let x = x.clamp(lo, hi);
        match self.kind {
            CoefficientKind::Magnitude => self.clamp(10f64.powf(x)),
            CoefficientKind::Exponent => x,
        }
    }

    fn validate(&self) -> FitResult<()> {
        if !(self.low.is_finite() && self.high.is_finite() && self.initial.is_finite()) {
            return Err(invalid_argument!("coefficient {} has non-finite bounds or initial value", self.name));
        }
        if self.low >= self.high {
            return Err(invalid_argument!(
                "coefficient {}: lower bound {} must be below upper bound {}",
                self.name, self.low, self.high
            ));
        }
        if self.kind == CoefficientKind::Magnitude && self.low <= 0.0 {
            return Err(invalid_argument!(
                "magnitude coefficient {} needs strictly positive bounds, got low={}",
                self.name, self.low
            ));
        }
        if self.initial < self.low || self.initial > self.high {
            return Err(invalid_argument!(
                "coefficient {}: initial value {} outside [{}, {}]",
                self.name, self.initial, self.low, self.high
            ));
        }
        Ok(())
    }
}

/// Rounding applied when projecting a parameter vector onto a [`CacheKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPrecision {
    /// Decimals kept of log10(value) for magnitude coefficients.
    pub log_decimals: u32,
    /// Decimals kept of the raw value for every other coefficient.
    pub linear_decimals: u32,
}

impl Default for KeyPrecision {
    fn default() -> Self {
        Self {
            log_decimals: 4,
            linear_decimals: 6,
        }
    }
}

/// Rounded, scale-normalized projection of a [`ParameterVector`].
///
/// Two vectors with equal keys are the same evaluation as far as the cache is
/// concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    entries: Vec<(String, i64)>,
}

impl CacheKey {
    pub fn entries(&self) -> &[(String, i64)] {
        &self.entries
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(name, q)| format!("{name}:{q}"))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

fn quantize(value: f64, decimals: u32) -> i64 {
    (value * 10f64.powi(decimals as i32)).round() as i64
}

/// Ordered name -> value mapping, validated against a [`ParameterLayout`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    values: BTreeMap<String, f64>,
}

impl ParameterVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.values
    }
}

impl fmt::Display for ParameterVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v:.6e}"))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Declared set of coefficients, split into optimized and fixed members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterLayout {
    coefficients: Vec<CoefficientDef>,
}

impl ParameterLayout {
    pub fn new(coefficients: Vec<CoefficientDef>) -> FitResult<Self> {
        let mut seen = HashSet::new();
        for coeff in &coefficients {
            if coeff.pair == 0 {
                return Err(invalid_argument!("coefficient {} uses pair index 0; pairs start at 1", coeff.name));
            }
            if !seen.insert(coeff.name.clone()) {
                return Err(invalid_argument!("duplicate coefficient name: {}", coeff.name));
            }
            coeff.validate()?;
        }
        if !coefficients.iter().any(|c| c.active) {
            return Err(invalid_argument!("at least one coefficient must be active"));
        }
        Ok(Self { coefficients })
    }

    pub fn coefficients(&self) -> &[CoefficientDef] {
        &self.coefficients
    }

    pub fn get(&self, name: &str) -> Option<&CoefficientDef> {
        self.coefficients.iter().find(|c| c.name == name)
    }

    pub fn active(&self) -> impl Iterator<Item = &CoefficientDef> {
        self.coefficients.iter().filter(|c| c.active)
    }

    /// Dimension of the optimizer's search vector.
    pub fn dimension(&self) -> usize {
        self.active().count()
    }

    /// Pair indices with at least one active member, ascending.
    pub fn active_pairs(&self) -> Vec<usize> {
        self.active()
            .map(|c| c.pair)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.coefficients.iter().map(|c| c.name.clone()).collect()
    }

    /// Override the starting value of a coefficient (clamped to its bounds).
    pub fn set_initial(&mut self, name: &str, value: f64) -> FitResult<()> {
        let coeff = self
            .coefficients
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| invalid_argument!("unknown coefficient: {}", name))?;
        if !value.is_finite() {
            return Err(invalid_argument!("initial value for {} is not finite", name));
        }
        coeff.initial = coeff.clamp(value);
        Ok(())
    }

    pub fn search_bounds(&self) -> Vec<(f64, f64)> {
        self.active().map(|c| c.search_bounds()).collect()
    }

    pub fn initial_point(&self) -> Vec<f64> {
        self.active().map(|c| c.to_search(c.initial)).collect()
    }

    pub fn initial_vector(&self) -> ParameterVector {
        ParameterVector {
            values: self
                .coefficients
                .iter()
                .map(|c| (c.name.clone(), c.initial))
                .collect(),
        }
    }

    /// Build a vector from explicit values, rejecting unknown names early.
    ///
    /// Missing active coefficients are an error; missing fixed ones take
    /// their declared value. Every value is clamped to its bounds.
    pub fn vector(&self, values: &BTreeMap<String, f64>) -> FitResult<ParameterVector> {
        for name in values.keys() {
            if self.get(name).is_none() {
                return Err(invalid_argument!("unknown coefficient: {}", name));
            }
        }
        let mut out = BTreeMap::new();
        for coeff in &self.coefficients {
            let value = match values.get(&coeff.name) {
                Some(v) => *v,
                None if coeff.active => {
                    return Err(invalid_argument!("missing value for active coefficient {}", coeff.name))
                }
                None => coeff.initial,
            };
            if !value.is_finite() {
                return Err(invalid_argument!("value for {} is not finite", coeff.name));
            }
            out.insert(coeff.name.clone(), coeff.clamp(value));
        }
        Ok(ParameterVector { values: out })
    }

    /// Map an optimizer vector to physical values, clamping each component.
    /// Non-finite components are rejected.
    pub fn decode(&self, x: &[f64]) -> FitResult<ParameterVector> {
        let dim = self.dimension();
        if x.len() != dim {
            return Err(invalid_argument!("search vector has {} components, layout expects {}", x.len(), dim));
        }
        let mut active_values = x.iter().copied();
        let mut values = BTreeMap::new();
        for coeff in &self.coefficients {
            let value = if coeff.active {
                let raw = active_values
                    .next()
                    .ok_or_else(|| invalid_argument!("search vector has no component for {}", coeff.name))?;
                if !raw.is_finite() {
                    return Err(invalid_argument!("search component for {} is {}", coeff.name, raw));
                }
                coeff.from_search(raw)
            } else {
                coeff.initial
            };
            values.insert(coeff.name.clone(), value);
        }
        Ok(ParameterVector { values })
    }

    pub fn encode(&self, params: &ParameterVector) -> Vec<f64> {
        self.active()
            .map(|c| c.to_search(params.get(&c.name).unwrap_or(c.initial)))
            .collect()
    }

    pub fn cache_key(&self, params: &ParameterVector, precision: &KeyPrecision) -> CacheKey {
        let entries = self
            .coefficients
            .iter()
            .map(|c| {
                let value = params.get(&c.name).unwrap_or(c.initial);
                let q = match c.kind {
                    CoefficientKind::Magnitude => quantize(value.log10(), precision.log_decimals),
                    CoefficientKind::Exponent => quantize(value, precision.linear_decimals),
                };
                (c.name.clone(), q)
            })
            .collect();
        CacheKey { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> ParameterLayout {
        ParameterLayout::new(vec![
            CoefficientDef::magnitude(1, 1e-10, 1.0, 1e-3),
            CoefficientDef::exponent(1, -20.0, 20.0, 2.0),
            CoefficientDef::magnitude(2, 1e-10, 1.0, 1e-4).fixed(),
            CoefficientDef::exponent(2, -20.0, 20.0, -2.0).fixed(),
        ])
        .unwrap()
    }

    #[test]
    fn layout_rejects_duplicate_names() {
        let err = ParameterLayout::new(vec![
            CoefficientDef::magnitude(1, 1e-6, 1.0, 1e-3),
            CoefficientDef::magnitude(1, 1e-6, 1.0, 1e-3),
        ])
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn layout_rejects_nonpositive_magnitude_bounds() {
        let err = ParameterLayout::new(vec![CoefficientDef::magnitude(1, 0.0, 1.0, 0.5)]).unwrap_err();
        assert!(err.to_string().contains("strictly positive"));
    }

    #[test]
    fn layout_requires_an_active_coefficient() {
        let err = ParameterLayout::new(vec![CoefficientDef::exponent(1, -1.0, 1.0, 0.0).fixed()]).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn decode_uses_log_space_for_magnitudes_and_holds_fixed_values() {
        let layout = sample_layout();
        assert_eq!(layout.dimension(), 2);
        assert_eq!(layout.search_bounds()[0], (-10.0, 0.0));

        let params = layout.decode(&[-3.0, 4.5]).unwrap();
        assert!((params.get("c1").unwrap() - 1e-3).abs() < 1e-15);
        assert_eq!(params.get("m1"), Some(4.5));
        assert_eq!(params.get("c2"), Some(1e-4));
        assert_eq!(params.get("m2"), Some(-2.0));
    }

    #[test]
    fn decode_clamps_out_of_bounds_components() {
        let layout = sample_layout();
        let params = layout.decode(&[3.0, -99.0]).unwrap();
        assert_eq!(params.get("c1"), Some(1.0));
        assert_eq!(params.get("m1"), Some(-20.0));
    }

    #[test]
    fn decode_rejects_wrong_dimension() {
        let layout = sample_layout();
        assert!(layout.decode(&[1.0]).is_err());
    }

    #[test]
    fn decode_rejects_non_finite_components() {
        let layout = sample_layout();
        let err = layout.decode(&[f64::NAN, 1.0]).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("c1"));
        assert!(layout.decode(&[-3.0, f64::INFINITY]).is_err());
    }

    #[test]
    fn encode_inverts_decode() {
        let layout = sample_layout();
        let x = layout.encode(&layout.decode(&[-4.25, 1.5]).unwrap());
        assert!((x[0] + 4.25).abs() < 1e-12);
        assert!((x[1] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn vector_rejects_unknown_names() {
        let layout = sample_layout();
        let mut values = BTreeMap::new();
        values.insert("c1".to_string(), 1e-3);
        values.insert("m1".to_string(), 1.0);
        values.insert("c9".to_string(), 1.0);
        assert!(layout.vector(&values).is_err());

        values.remove("c9");
        let params = layout.vector(&values).unwrap();
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn nearby_vectors_share_a_cache_key() {
        let layout = sample_layout();
        let precision = KeyPrecision::default();
        let a = layout.decode(&[-3.0, 1.0]).unwrap();
        let b = layout.decode(&[-3.000_001, 1.000_000_1]).unwrap();
        let c = layout.decode(&[-3.01, 1.0]).unwrap();

        assert_eq!(layout.cache_key(&a, &precision), layout.cache_key(&b, &precision));
        assert_ne!(layout.cache_key(&a, &precision), layout.cache_key(&c, &precision));
    }

    #[test]
    fn active_pairs_are_sorted_and_unique() {
        let layout = ParameterLayout::new(vec![
            CoefficientDef::magnitude(3, 1e-6, 1.0, 1e-3),
            CoefficientDef::exponent(1, -5.0, 5.0, 1.0),
            CoefficientDef::magnitude(1, 1e-6, 1.0, 1e-3),
            CoefficientDef::exponent(2, -5.0, 5.0, 1.0).fixed(),
        ])
        .unwrap();
        assert_eq!(layout.active_pairs(), vec![1, 3]);
    }
}
