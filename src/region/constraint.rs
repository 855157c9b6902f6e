//! Trust region around the frozen anchor.
//!
//! Every tracked parameter owns one scalar radius.  Projection rescales the
//! deviation `θ − θ_a` so that its norm equals the radius:
//!
//!   θ ← θ_a + ratio·(θ − θ_a),   ratio = r / (‖θ − θ_a‖ + 1e-8)
//!
//! This is a hard rescale, not a clamp: a deviation smaller than `r` is
//! stretched out to it.  `apply` hands back the ratios it used as a
//! `ProjectionScope`; `reverse` consumes that scope and divides the same
//! ratios back out, so the round trip never depends on recomputing a norm.

use anyhow::{bail, Context};
use ndarray::Axis;
use serde::{Deserialize, Serialize};

use crate::core::params::{l2_norm, row_l1_norms, AnchorSnapshot, ParameterSet, RegionRole, Tensor};
use crate::learning::perturbation::{PerturbationSeed, PerturbationStream};

/// Added to every norm before dividing.
pub const RATIO_EPSILON: f32 = crate::config::RATIO_EPSILON;

/// How the size of a deviation is measured.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormMode {
    /// One Euclidean norm over the whole tensor.
    #[default]
    L2,
    /// Sum of absolute deviations per leading row, one ratio per row.
    RowL1,
}

/// Projection factor for one parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Ratio {
    Scalar(f32),
    Rows(Vec<f32>),
}

/// `radius / (‖current − anchor‖ + ε)` under `mode`.
pub fn project_ratio(current: &Tensor, anchor: &Tensor, radius: f32, mode: NormMode) -> Ratio {
    let delta = current - anchor;
    match mode {
        NormMode::L2 => Ratio::Scalar(radius / (l2_norm(&delta) + RATIO_EPSILON)),
        NormMode::RowL1 => Ratio::Rows(
            row_l1_norms(&delta)
                .into_iter()
                .map(|n| radius / (n + RATIO_EPSILON))
                .collect(),
        ),
    }
}

/// Size of the deviation as a single scalar: the L2 norm, or the mean row-L1
/// norm.  Used as the base radius `r0`.
pub fn deviation_size(current: &Tensor, anchor: &Tensor, mode: NormMode) -> f32 {
    let delta = current - anchor;
    match mode {
        NormMode::L2 => l2_norm(&delta),
        NormMode::RowL1 => {
            let rows = row_l1_norms(&delta);
            if rows.is_empty() {
                0.0
            } else {
                rows.iter().sum::<f32>() / rows.len() as f32
            }
        }
    }
}

/// `∂L/∂r` for one projected parameter, given `grad = ∇L` at the projected
/// point.  The projected value is `θ_a + r·δ/(‖δ‖ + ε)` (per row for
/// `RowL1`), so the sensitivity is `Σ grad ⊙ δ/(‖δ‖ + ε)`.
pub fn radius_sensitivity(current: &Tensor, anchor: &Tensor, grad: &Tensor, mode: NormMode) -> f32 {
    let delta = current - anchor;
    let unit = |n: f32| 1.0 / (n + RATIO_EPSILON);
    match mode {
        NormMode::L2 => {
            let k = unit(l2_norm(&delta));
            delta.iter().zip(grad.iter()).map(|(d, g)| d * g * k).sum()
        }
        NormMode::RowL1 if delta.ndim() == 0 => {
            let k = unit(delta.iter().map(|v| v.abs()).sum());
            delta.iter().zip(grad.iter()).map(|(d, g)| d * g * k).sum()
        }
        NormMode::RowL1 => delta
            .axis_iter(Axis(0))
            .zip(grad.axis_iter(Axis(0)))
            .map(|(d_row, g_row)| {
                let k = unit(d_row.iter().map(|v| v.abs()).sum());
                d_row.iter().zip(g_row.iter()).map(|(d, g)| d * g * k).sum::<f32>()
            })
            .sum(),
    }
}

fn scale_deviation(candidate: &mut Tensor, anchor: &Tensor, ratio: &Ratio, invert: bool) {
    let rescale = |k: f32| {
        move |c: &mut f32, &a: &f32| {
            let d = *c - a;
            *c = if !invert {
                a + k * d
            } else if k == 0.0 {
                a
            } else {
                a + d / k
            };
        }
    };

    match ratio {
        Ratio::Scalar(k) => candidate.zip_mut_with(anchor, rescale(*k)),
        Ratio::Rows(ks) if candidate.ndim() == 0 => {
            if let Some(&k) = ks.first() {
                candidate.zip_mut_with(anchor, rescale(k));
            }
        }
        Ratio::Rows(ks) => {
            for ((mut row, a_row), &k) in candidate
                .axis_iter_mut(Axis(0))
                .zip(anchor.axis_iter(Axis(0)))
                .zip(ks.iter())
            {
                row.zip_mut_with(&a_row, rescale(k));
            }
        }
    }
}

/// Ratios used by one `apply`, valid until the matching `reverse`.
#[must_use = "a projection scope must be passed to `reverse` or explicitly dropped"]
#[derive(Debug)]
pub struct ProjectionScope {
    entries: Vec<(String, Ratio)>,
}

impl ProjectionScope {
    pub fn ratio(&self, name: &str) -> Option<&Ratio> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One tracked parameter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedRadius {
    pub name: String,
    /// Position in the parameter set.
    pub index: usize,
    pub radius: f32,
    /// Last-reset base value `r0`.
    pub base: f32,
}

/// Seeded probe over the radii: `z_i = r0_i · N(0, 1)`.
#[derive(Clone, Debug)]
pub struct RadiusProbe {
    pub seed: PerturbationSeed,
    pub z: Vec<f32>,
    pub scale: f32,
}

impl RadiusProbe {
    pub fn draw(seed: PerturbationSeed, bases: &[f32], scale: f32) -> Self {
        let mut stream = PerturbationStream::new(seed);
        let z = bases.iter().map(|&b| b * stream.next_scalar()).collect();
        Self { seed, z, scale }
    }
}

/// Per-parameter radii over the tracked, trainable parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstraintSet {
    mode: NormMode,
    entries: Vec<TrackedRadius>,
    initialized: bool,
}

impl ConstraintSet {
    /// Track every trainable parameter tagged `RegionRole::Tracked`.
    ///
    /// Fails if the anchor is missing a tracked parameter or disagrees on its
    /// shape.
    pub fn new(params: &ParameterSet, anchor: &AnchorSnapshot, mode: NormMode) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        for (index, e) in params.entries().iter().enumerate() {
            if !e.trainable || e.tag.region == RegionRole::Excluded {
                continue;
            }
            let a = anchor
                .get(&e.name)
                .with_context(|| format!("anchor has no entry for tracked parameter '{}'", e.name))?;
            if a.shape() != e.value.shape() {
                bail!(
                    "anchor shape {:?} does not match parameter '{}' shape {:?}",
                    a.shape(),
                    e.name,
                    e.value.shape()
                );
            }
            entries.push(TrackedRadius {
                name: e.name.clone(),
                index,
                radius: 0.0,
                base: 0.0,
            });
        }
        Ok(Self {
            mode,
            entries,
            initialized: false,
        })
    }

    pub fn mode(&self) -> NormMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn entries(&self) -> &[TrackedRadius] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn radii(&self) -> Vec<f32> {
        self.entries.iter().map(|e| e.radius).collect()
    }

    pub fn bases(&self) -> Vec<f32> {
        self.entries.iter().map(|e| e.base).collect()
    }

    pub fn radius(&self, name: &str) -> Option<f32> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.radius)
    }

    pub fn set_radius(&mut self, name: &str, radius: f32) -> anyhow::Result<()> {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(e) => {
                e.radius = radius;
                Ok(())
            }
            None => bail!("'{}' is not a tracked parameter", name),
        }
    }

    /// Overwrite every radius, in tracked order.
    pub fn set_radii(&mut self, radii: &[f32]) {
        debug_assert_eq!(radii.len(), self.entries.len());
        for (e, &r) in self.entries.iter_mut().zip(radii) {
            e.radius = r;
        }
    }

    /// Current deviation size of every tracked parameter, in tracked order.
    pub fn deviations(&self, params: &ParameterSet, anchor: &AnchorSnapshot) -> anyhow::Result<Vec<f32>> {
        self.entries
            .iter()
            .map(|e| {
                let (current, a) = self.pair(params, anchor, e)?;
                Ok(deviation_size(current, a, self.mode))
            })
            .collect()
    }

    /// Set both radius and base to the given deviations.
    pub fn reset_bases(&mut self, deviations: &[f32]) {
        for (e, &d) in self.entries.iter_mut().zip(deviations) {
            e.radius = d;
            e.base = d;
        }
        self.initialized = true;
    }

    /// Set only the bases, leaving radii where they are.
    pub fn rebase(&mut self, deviations: &[f32]) {
        for (e, &d) in self.entries.iter_mut().zip(deviations) {
            e.base = d;
        }
    }

    /// Keep every radius inside `[(1 − τ)·r0, (1 + τ)·r0]`.
    pub fn clip_to_bases(&mut self, tolerance: f32) {
        for e in &mut self.entries {
            let lo = (1.0 - tolerance) * e.base;
            let hi = (1.0 + tolerance) * e.base;
            e.radius = e.radius.max(lo).min(hi);
        }
    }

    /// `r_i ← r_i + direction·z_i·scale`.
    pub fn perturb_radii(&mut self, direction: f32, probe: &RadiusProbe) {
        for (e, &z) in self.entries.iter_mut().zip(&probe.z) {
            e.radius += direction * z * probe.scale;
        }
    }

    /// Ratio for every tracked parameter at the current radii.
    pub fn ratios(&self, params: &ParameterSet, anchor: &AnchorSnapshot) -> anyhow::Result<Vec<Ratio>> {
        self.entries
            .iter()
            .map(|e| {
                let (current, a) = self.pair(params, anchor, e)?;
                Ok(project_ratio(current, a, e.radius, self.mode))
            })
            .collect()
    }

    /// Project every tracked parameter onto its radius.
    pub fn apply(&self, candidate: &mut ParameterSet, anchor: &AnchorSnapshot) -> anyhow::Result<ProjectionScope> {
        let ratios = self.ratios(candidate, anchor)?;
        let mut entries = Vec::with_capacity(ratios.len());
        for (e, ratio) in self.entries.iter().zip(ratios) {
            let a = self.anchor_for(anchor, e)?;
            scale_deviation(&mut candidate.entry_mut(e.index).value, a, &ratio, false);
            entries.push((e.name.clone(), ratio));
        }
        Ok(ProjectionScope { entries })
    }

    /// Undo the `apply` that produced `scope`.
    ///
    /// # Panics
    ///
    /// If `scope` was not produced by this constraint set.
    pub fn reverse(
        &self,
        candidate: &mut ParameterSet,
        anchor: &AnchorSnapshot,
        scope: ProjectionScope,
    ) -> anyhow::Result<()> {
        let matches = scope.entries.len() == self.entries.len()
            && scope
                .entries
                .iter()
                .zip(&self.entries)
                .all(|((name, _), e)| name == &e.name);
        if !matches {
            panic!(
                "projection scope with {} entries does not belong to this constraint set ({} tracked)",
                scope.entries.len(),
                self.entries.len()
            );
        }

        for (e, (_, ratio)) in self.entries.iter().zip(scope.entries) {
            let a = self.anchor_for(anchor, e)?;
            scale_deviation(&mut candidate.entry_mut(e.index).value, a, &ratio, true);
        }
        Ok(())
    }

    /// Apply and keep the result.
    pub fn commit(&self, candidate: &mut ParameterSet, anchor: &AnchorSnapshot) -> anyhow::Result<()> {
        let _committed = self.apply(candidate, anchor)?;
        Ok(())
    }

    fn anchor_for<'a>(&self, anchor: &'a AnchorSnapshot, e: &TrackedRadius) -> anyhow::Result<&'a Tensor> {
        anchor
            .get(&e.name)
            .with_context(|| format!("anchor has no entry for '{}'", e.name))
    }

    fn pair<'p, 'a>(
        &self,
        params: &'p ParameterSet,
        anchor: &'a AnchorSnapshot,
        e: &TrackedRadius,
    ) -> anyhow::Result<(&'p Tensor, &'a Tensor)> {
        if e.index >= params.len() || params.entry(e.index).name != e.name {
            bail!("parameter '{}' is not at position {} of the candidate", e.name, e.index);
        }
        Ok((&params.entry(e.index).value, self.anchor_for(anchor, e)?))
    }
}
