//! Backbone + head classifier and the helpers that train or serve it.
//!
//! Input is `(N, H, W, 3)` in pixel range `[0, 255]`; the graph rescales to
//! `[-1, 1]` and moves channels first before the backbone.

pub mod artifact;
pub mod mobilenet;
pub mod pretrained;

use std::collections::{HashMap, HashSet};

use tch::{nn, nn::ModuleT, Tensor};

use mobilenet::Backbone;

pub const BACKBONE: &str = "backbone";
pub const HEAD: &str = "head";

const HEAD_HIDDEN: i64 = 128;
const HEAD_DROPOUT: f64 = 0.2;

/// `[0, 255]` -> `[-1, 1]`, NHWC -> NCHW.
pub fn rescale(xs: &Tensor) -> Tensor {
    (xs / 127.5 - 1.0).permute([0, 3, 1, 2])
}

/// Pooling, dropout, dense(128, relu), dropout, dense(1).
#[derive(Debug)]
pub struct Head {
    hidden: nn::Linear,
    out: nn::Linear,
}

impl Head {
    pub fn new(vs: &nn::Path, in_features: i64) -> Self {
        Self {
            hidden: nn::linear(vs / "hidden", in_features, HEAD_HIDDEN, Default::default()),
            out: nn::linear(vs / "out", HEAD_HIDDEN, 1, Default::default()),
        }
    }
}

impl ModuleT for Head {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.adaptive_avg_pool2d([1, 1])
            .flatten(1, -1)
            .dropout(HEAD_DROPOUT, train)
            .apply(&self.hidden)
            .relu()
            .dropout(HEAD_DROPOUT, train)
            .apply(&self.out)
    }
}

#[derive(Debug)]
pub struct LightNet {
    backbone: Backbone,
    head: Head,
}

impl LightNet {
    /// Builds under `root/backbone` and `root/head`; `root` must be the var store root.
    pub fn new(root: &nn::Path, width_mult: f64) -> Self {
        let backbone = Backbone::new(&(root / BACKBONE), BACKBONE, width_mult);
        let head = Head::new(&(root / HEAD), backbone.out_channels());
        Self { backbone, head }
    }

    pub fn backbone_layers(&self) -> &[String] {
        self.backbone.layers()
    }

    /// Sigmoid output of shape `(N, 1)`, dropout off.
    pub fn probabilities(&self, xs: &Tensor) -> Tensor {
        self.forward_t(xs, false).sigmoid()
    }
}

impl ModuleT for LightNet {
    /// Logits of shape `(N, 1)`. Batch-norm in the backbone always runs on
    /// its stored statistics; `train` only switches the head's dropout.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let features = self.backbone.forward_t(&rescale(xs), false);
        self.head.forward_t(&features, train)
    }
}

fn is_parameter(name: &str) -> bool {
    name.ends_with(".weight") || name.ends_with(".bias")
}

/// Counts after a freeze pass, in tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreezeSummary {
    pub trainable_backbone: usize,
    pub frozen_backbone: usize,
    pub head: usize,
}

/// Freezes the backbone except its last `trainable_tail` layers; the head
/// always stays trainable. Buffers (batch-norm statistics) are untouched.
pub fn set_trainable_backbone(
    vs: &nn::VarStore,
    layers: &[String],
    trainable_tail: Option<usize>,
) -> FreezeSummary {
    let tail = trainable_tail.unwrap_or(0).min(layers.len());
    let open: HashSet<&str> = layers[layers.len() - tail..].iter().map(String::as_str).collect();
    let prefix = format!("{BACKBONE}.");

    let mut summary = FreezeSummary { trainable_backbone: 0, frozen_backbone: 0, head: 0 };
    for (name, var) in vs.variables() {
        if !is_parameter(&name) {
            continue;
        }
        if !name.starts_with(&prefix) {
            let _ = var.set_requires_grad(true);
            summary.head += 1;
            continue;
        }
        let layer = name.rsplit_once('.').map_or(name.as_str(), |(l, _)| l);
        let trainable = open.contains(layer);
        let _ = var.set_requires_grad(trainable);
        if trainable {
            summary.trainable_backbone += 1;
        } else {
            summary.frozen_backbone += 1;
        }
    }
    summary
}

/// Detached copies of every variable, used to roll back to the best epoch.
pub struct WeightSnapshot(HashMap<String, Tensor>);

impl WeightSnapshot {
    pub fn capture(vs: &nn::VarStore) -> Self {
        let copies = tch::no_grad(|| {
            vs.variables()
                .into_iter()
                .map(|(name, t)| (name, t.detach().copy()))
                .collect()
        });
        Self(copies)
    }

    pub fn restore(&self, vs: &nn::VarStore) {
        let targets = vs.variables();
        for (name, t) in &self.0 {
            pretrained::try_copy(&targets, name, t);
        }
    }
}
