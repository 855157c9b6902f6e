//! Parameter model: named tensors, role tagging, and the frozen anchor.
//!
//! A `ParameterSet` is an ordered list of named tensors.  The optimisers in
//! this crate only ever mutate values in place and always walk the set in
//! insertion order, so every component that regenerates noise or caches
//! projection ratios sees the same enumeration.

use std::collections::HashMap;

use anyhow::bail;
use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

/// Dense `f32` tensor of any rank.
pub type Tensor = ArrayD<f32>;

/// Weight-decay classification of a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamRole {
    /// Weight-bearing tensor: receives weight decay.
    Weight,
    /// Bias or normalisation scale: no weight decay.
    BiasOrNorm,
}

/// Trust-region membership of a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionRole {
    /// Gets a learned radius and is projected around the anchor.
    Tracked,
    /// Left untouched by every projection.
    Excluded,
}

/// Classification assigned once at setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamTag {
    pub role: ParamRole,
    pub region: RegionRole,
}

impl Default for ParamTag {
    fn default() -> Self {
        Self {
            role: ParamRole::Weight,
            region: RegionRole::Tracked,
        }
    }
}

/// Which parameters are kept out of the trust region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExclusionRule {
    /// Every parameter is tracked.
    None,
    /// Exact names are excluded.
    Names(Vec<String>),
    /// Names containing any pattern are excluded.
    Containing(Vec<String>),
    /// Parameter-efficient mode: only names containing the adapter marker are tracked.
    AdapterOnly(String),
    /// Only names containing one of the patterns are tracked.
    KeepOnly(Vec<String>),
}

impl ExclusionRule {
    /// Whether `name` falls outside the trust region.
    pub fn excludes(&self, name: &str) -> bool {
        match self {
            ExclusionRule::None => false,
            ExclusionRule::Names(names) => names.iter().any(|n| n == name),
            ExclusionRule::Containing(patterns) => patterns.iter().any(|p| name.contains(p.as_str())),
            ExclusionRule::AdapterOnly(marker) => !name.contains(marker.as_str()),
            ExclusionRule::KeepOnly(patterns) => !patterns.iter().any(|p| name.contains(p.as_str())),
        }
    }
}

/// Setup-time tagging rules.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaggingRules {
    /// Substrings that mark a bias or normalisation tensor.
    pub no_decay: Vec<String>,

    /// Trust-region exclusion.
    pub exclusion: ExclusionRule,

    /// Substrings of parameters that are frozen (not trainable at all).
    pub freeze: Vec<String>,
}

impl Default for TaggingRules {
    fn default() -> Self {
        Self {
            no_decay: vec![
                "bias".to_string(),
                "layer_norm".to_string(),
                "layernorm".to_string(),
            ],
            exclusion: ExclusionRule::None,
            freeze: Vec::new(),
        }
    }
}

impl TaggingRules {
    /// Classify a single parameter name.
    pub fn classify(&self, name: &str) -> ParamTag {
        let role = if self.no_decay.iter().any(|p| name.contains(p.as_str())) {
            ParamRole::BiasOrNorm
        } else {
            ParamRole::Weight
        };
        let region = if self.exclusion.excludes(name) {
            RegionRole::Excluded
        } else {
            RegionRole::Tracked
        };
        ParamTag { role, region }
    }

    /// Whether a parameter is frozen by these rules.
    pub fn is_frozen(&self, name: &str) -> bool {
        self.freeze.iter().any(|p| name.contains(p.as_str()))
    }
}

/// A single named parameter.
#[derive(Clone, Debug)]
pub struct ParamEntry {
    pub name: String,
    pub value: Tensor,
    pub trainable: bool,
    pub tag: ParamTag,
}

/// Ordered mapping from parameter name to tensor.
#[derive(Clone, Debug, Default)]
pub struct ParameterSet {
    entries: Vec<ParamEntry>,
    index: HashMap<String, usize>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trainable parameter with the default tag.
    pub fn insert(&mut self, name: &str, value: Tensor) -> anyhow::Result<()> {
        self.insert_with(name, value, true)
    }

    /// Append a parameter with an explicit trainable flag.
    pub fn insert_with(&mut self, name: &str, value: Tensor, trainable: bool) -> anyhow::Result<()> {
        if self.index.contains_key(name) {
            bail!("duplicate parameter name '{}'", name);
        }
        self.index.insert(name.to_string(), self.entries.len());
        self.entries.push(ParamEntry {
            name: name.to_string(),
            value,
            trainable,
            tag: ParamTag::default(),
        });
        Ok(())
    }

    /// Builder-style insert from a flat vector and a shape.
    pub fn with_param(mut self, name: &str, shape: &[usize], values: Vec<f32>) -> anyhow::Result<Self> {
        let value = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        self.insert(name, value)?;
        Ok(self)
    }

    /// Tag every parameter once.  Frozen parameters lose their trainable flag.
    pub fn apply_tags(&mut self, rules: &TaggingRules) {
        for entry in &mut self.entries {
            entry.tag = rules.classify(&entry.name);
            if rules.is_frozen(&entry.name) {
                entry.trainable = false;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ParamEntry] {
        &self.entries
    }

    /// Mutable access to the entries.  Names and order cannot change through it.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ParamEntry> {
        self.entries.iter_mut()
    }

    pub fn entry(&self, idx: usize) -> &ParamEntry {
        &self.entries[idx]
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut ParamEntry {
        &mut self.entries[idx]
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.position(name).map(|i| &self.entries[i].value)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.position(name).map(move |i| &mut self.entries[i].value)
    }

    /// Trainable entries in enumeration order.
    pub fn trainable(&self) -> impl Iterator<Item = &ParamEntry> {
        self.entries.iter().filter(|e| e.trainable)
    }

    pub fn trainable_mut(&mut self) -> impl Iterator<Item = &mut ParamEntry> {
        self.entries.iter_mut().filter(|e| e.trainable)
    }

    pub fn trainable_count(&self) -> usize {
        self.trainable().count()
    }

    /// Total number of scalar values across all parameters.
    pub fn numel(&self) -> usize {
        self.entries.iter().map(|e| e.value.len()).sum()
    }

    /// Whether every value is finite.
    pub fn is_finite(&self) -> bool {
        self.entries
            .iter()
            .all(|e| e.value.iter().all(|v| v.is_finite()))
    }
}

/// Immutable copy of a parameter set, taken once before training.
#[derive(Clone, Debug)]
pub struct AnchorSnapshot {
    values: Vec<(String, Tensor)>,
    index: HashMap<String, usize>,
}

impl AnchorSnapshot {
    /// Deep-copy every parameter value.
    pub fn capture(params: &ParameterSet) -> Self {
        let values: Vec<(String, Tensor)> = params
            .entries()
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect();
        let index = values
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (name.clone(), i))
            .collect();
        Self { values, index }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.index.get(name).map(|&i| &self.values[i].1)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Euclidean norm over the whole tensor.
pub fn l2_norm(t: &Tensor) -> f32 {
    t.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Sum of absolute values along every axis but the first.
///
/// A 1-D tensor yields one entry per element; a scalar yields one entry.
pub fn row_l1_norms(t: &Tensor) -> Vec<f32> {
    if t.ndim() == 0 {
        return vec![t.iter().map(|v| v.abs()).sum()];
    }
    t.axis_iter(Axis(0))
        .map(|row| row.iter().map(|v| v.abs()).sum())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn sample_set() -> ParameterSet {
        ParameterSet::new()
            .with_param("model.embed_tokens.weight", &[4, 2], vec![0.0; 8])
            .and_then(|p| p.with_param("layers.0.self_attn.k_proj.weight", &[2, 2], vec![1.0; 4]))
            .and_then(|p| p.with_param("layers.0.self_attn.q_proj.weight", &[2, 2], vec![1.0; 4]))
            .and_then(|p| p.with_param("layers.0.self_attn.q_proj.bias", &[2], vec![0.5; 2]))
            .and_then(|p| p.with_param("layers.0.layer_norm.weight", &[2], vec![1.0; 2]))
            .and_then(|p| p.with_param("layers.0.lora_A", &[1, 2], vec![0.1; 2]))
            .expect("valid shapes")
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut set = ParameterSet::new();
        set.insert("w", arr1(&[1.0f32]).into_dyn()).unwrap();
        let err = set.insert("w", arr1(&[2.0f32]).into_dyn()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_default_decay_roles() {
        let rules = TaggingRules::default();
        assert_eq!(rules.classify("fc.weight").role, ParamRole::Weight);
        assert_eq!(rules.classify("fc.bias").role, ParamRole::BiasOrNorm);
        assert_eq!(rules.classify("h.0.layernorm.weight").role, ParamRole::BiasOrNorm);
        assert_eq!(rules.classify("h.0.layer_norm.weight").role, ParamRole::BiasOrNorm);
    }

    #[test]
    fn test_adapter_only_exclusion() {
        let rule = ExclusionRule::AdapterOnly("lora".to_string());
        assert!(rule.excludes("layers.0.self_attn.q_proj.weight"));
        assert!(!rule.excludes("layers.0.lora_A"));
    }

    #[test]
    fn test_keep_only_exclusion() {
        let rule = ExclusionRule::KeepOnly(vec![
            "self_attn.k_proj.weight".to_string(),
            "self_attn.v_proj.weight".to_string(),
        ]);
        assert!(!rule.excludes("layers.3.self_attn.k_proj.weight"));
        assert!(rule.excludes("layers.3.self_attn.q_proj.weight"));
        assert!(rule.excludes("layers.3.self_attn.k_proj.bias"));
    }

    #[test]
    fn test_apply_tags_and_freeze() {
        let mut set = sample_set();
        let rules = TaggingRules {
            exclusion: ExclusionRule::KeepOnly(vec!["k_proj.weight".to_string()]),
            freeze: vec!["embed_tokens".to_string()],
            ..Default::default()
        };
        set.apply_tags(&rules);

        assert!(!set.entry(0).trainable);
        assert_eq!(set.trainable_count(), 5);
        assert_eq!(set.entry(1).tag.region, RegionRole::Tracked);
        assert_eq!(set.entry(2).tag.region, RegionRole::Excluded);
        assert_eq!(set.entry(3).tag.role, ParamRole::BiasOrNorm);
        assert_eq!(set.entry(4).tag.role, ParamRole::BiasOrNorm);
    }

    #[test]
    fn test_anchor_is_independent_copy() {
        let mut set = sample_set();
        let anchor = AnchorSnapshot::capture(&set);
        set.get_mut("layers.0.lora_A").unwrap().fill(9.0);

        let a = anchor.get("layers.0.lora_A").unwrap();
        assert!(a.iter().all(|&v| (v - 0.1).abs() < 1e-7));
        assert_eq!(anchor.len(), set.len());
    }

    #[test]
    fn test_norms() {
        let t = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![3.0, -4.0, 0.0, 1.0]).unwrap();
        assert!((l2_norm(&t) - 26.0f32.sqrt()).abs() < 1e-6);
        assert_eq!(row_l1_norms(&t), vec![7.0, 1.0]);

        let v = arr1(&[-1.0f32, 2.0]).into_dyn();
        assert_eq!(row_l1_norms(&v), vec![1.0, 2.0]);
    }
}
