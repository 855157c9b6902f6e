//! Best-model snapshots.
//!
//! A checkpoint is a detached copy of every parameter value plus the step
//! and metric it was taken at.  Serialised with bincode.

use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use super::params::{ParameterSet, Tensor};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Global step the snapshot was taken after.
    pub step: u64,

    /// Evaluation metric at that step (higher is better).
    pub metric: f32,

    pub params: Vec<(String, Tensor)>,
}

impl Checkpoint {
    pub fn capture(params: &ParameterSet, step: u64, metric: f32) -> Self {
        Self {
            step,
            metric,
            params: params
                .entries()
                .iter()
                .map(|e| (e.name.clone(), e.value.clone()))
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write checkpoint '{}'", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read checkpoint '{}'", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("corrupt checkpoint '{}'", path.display()))
    }

    /// Copy the stored values back into `params`, matching by name.
    ///
    /// Nothing is written unless every stored tensor has a counterpart of the
    /// same shape.
    pub fn restore_into(&self, params: &mut ParameterSet) -> anyhow::Result<()> {
        for (name, value) in &self.params {
            match params.get(name) {
                None => bail!("checkpoint parameter '{}' is not in the model", name),
                Some(t) if t.shape() != value.shape() => bail!(
                    "checkpoint parameter '{}' has shape {:?}, model has {:?}",
                    name,
                    value.shape(),
                    t.shape()
                ),
                Some(_) => {}
            }
        }
        for (name, value) in &self.params {
            if let Some(t) = params.get_mut(name) {
                t.assign(value);
            }
        }
        Ok(())
    }
}
