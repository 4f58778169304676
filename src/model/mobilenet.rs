//! MobileNetV2 feature extractor.
//!
//! Variable names follow `stem`, `ir_{stage}_{block}.{expand,dw,project}`
//! and `last`, each conv followed by a `bn` child. The pretrained loader
//! maps checkpoint keys onto exactly this layout.

use tch::{nn, nn::ModuleT, Tensor};

/// Expansion t, output channels c, repeats n, first stride s.
pub const STAGES: &[(i64, i64, i64, i64)] = &[
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

pub fn round_channels(c: i64, wm: f64) -> i64 {
    let v = (c as f64 * wm).round() as i64;
    v.max(8)
}

fn relu6(x: &Tensor) -> Tensor {
    x.clamp(0.0, 6.0)
}

/// Records the backbone's layer sequence in build order, counted the way
/// Keras lists MobileNetV2 layers: every conv and batch-norm, plus the
/// parameter-free relu, stride padding and residual-add steps.
struct LayerLog {
    prefix: String,
    layers: Vec<String>,
}

impl LayerLog {
    fn conv_bn(
        &mut self,
        vs: &nn::Path,
        name: &str,
        in_c: i64,
        out_c: i64,
        ksize: i64,
        cfg: nn::ConvConfig,
    ) -> (nn::Conv2D, nn::BatchNorm) {
        let p = vs.sub(name);
        let conv = nn::conv2d(&p, in_c, out_c, ksize, nn::ConvConfig { bias: false, ..cfg });
        let bn = nn::batch_norm2d(&p.sub("bn"), out_c, Default::default());
        self.push(name);
        self.push(&format!("{name}.bn"));
        (conv, bn)
    }

    /// Parameter-free step such as `dw.relu`, `pad` or `add`.
    fn push(&mut self, name: &str) {
        self.layers.push(format!("{}.{name}", self.prefix));
    }
}

/// Layer entries that own a `.weight` variable.
pub fn is_parametric(layer: &str) -> bool {
    !PARAMETER_FREE.iter().any(|s| layer.ends_with(s))
}

const PARAMETER_FREE: &[&str] = &[".relu", ".pad", ".add"];

#[derive(Debug)]
struct InvertedResidual {
    expand: Option<(nn::Conv2D, nn::BatchNorm)>,
    dw: (nn::Conv2D, nn::BatchNorm),
    project: (nn::Conv2D, nn::BatchNorm),
    use_res: bool,
}

impl InvertedResidual {
    fn new(vs: &nn::Path, log: &mut LayerLog, name: &str, in_c: i64, out_c: i64, stride: i64, t: i64) -> Self {
        let hidden = in_c * t;
        let block = vs.sub(name);
        let mut sub = LayerLog { prefix: format!("{}.{name}", log.prefix), layers: Vec::new() };

        let expand = (t != 1).then(|| {
            let layer = sub.conv_bn(&block, "expand", in_c, hidden, 1, Default::default());
            sub.push("expand.relu");
            layer
        });
        if stride == 2 {
            sub.push("pad");
        }
        let dw = sub.conv_bn(
            &block,
            "dw",
            hidden,
            hidden,
            3,
            nn::ConvConfig { stride, padding: 1, groups: hidden, ..Default::default() },
        );
        sub.push("dw.relu");
        let project = sub.conv_bn(&block, "project", hidden, out_c, 1, Default::default());
        let use_res = stride == 1 && in_c == out_c;
        if use_res {
            sub.push("add");
        }
        log.layers.append(&mut sub.layers);

        Self { expand, dw, project, use_res }
    }
}

impl ModuleT for InvertedResidual {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let mut x = xs.shallow_clone();
        if let Some((conv, bn)) = &self.expand {
            x = relu6(&x.apply(conv).apply_t(bn, train));
        }
        x = relu6(&x.apply(&self.dw.0).apply_t(&self.dw.1, train));
        x = x.apply(&self.project.0).apply_t(&self.project.1, train);
        if self.use_res { xs + x } else { x }
    }
}

/// Convolutional trunk, `(N, 3, H, W)` -> `(N, 1280·α, H/32, W/32)`.
#[derive(Debug)]
pub struct Backbone {
    seq: nn::SequentialT,
    layers: Vec<String>,
    out_channels: i64,
}

impl Backbone {
    /// `prefix` must be the dotted name of `vs` inside its var store.
    pub fn new(vs: &nn::Path, prefix: &str, alpha: f64) -> Self {
        let mut log = LayerLog { prefix: prefix.to_string(), layers: Vec::new() };
        let mut seq = nn::seq_t();

        let first = round_channels(32, alpha);
        let (conv, bn) = log.conv_bn(
            vs,
            "stem",
            3,
            first,
            3,
            nn::ConvConfig { stride: 2, padding: 1, ..Default::default() },
        );
        log.push("stem.relu");
        seq = seq.add(conv).add(bn).add_fn(relu6);

        let mut in_c = first;
        for (i, &(t, c, n, s)) in STAGES.iter().enumerate() {
            let out_c = round_channels(c, alpha);
            for j in 0..n {
                let stride = if j == 0 { s } else { 1 };
                let name = format!("ir_{i}_{j}");
                seq = seq.add(InvertedResidual::new(vs, &mut log, &name, in_c, out_c, stride, t));
                in_c = out_c;
            }
        }

        let last = round_channels(1280, alpha);
        let (conv, bn) = log.conv_bn(vs, "last", in_c, last, 1, Default::default());
        log.push("last.relu");
        seq = seq.add(conv).add(bn).add_fn(relu6);

        Self { seq, layers: log.layers, out_channels: last }
    }

    /// Dotted paths of all layers, input side first. Conv and batch-norm
    /// entries name their variable prefix; see [`is_parametric`].
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn out_channels(&self) -> i64 {
        self.out_channels
    }
}

impl ModuleT for Backbone {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.seq.forward_t(xs, train)
    }
}
