//! ImageNet MobileNetV2 weights from a safetensors file.
//!
//! Three key schemas are recognised: timm (`conv_stem`, `blocks.k.conv.*`),
//! torchvision-like `blocks.i.j.{conv_dw,conv_pw,bn1,..}`, and keys that
//! already use this crate's `backbone.*` layout. Tensors whose target is
//! missing or has another shape are skipped.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use half::f16;
use safetensors::{tensor::Dtype, SafeTensors};
use tch::{nn, Kind, Tensor};
use tracing::{debug, warn};

use super::mobilenet::{round_channels, STAGES};
use super::BACKBONE;
use crate::error::{DetectError, Result};

fn pretrained_err(path: &Path, reason: impl Into<String>) -> DetectError {
    DetectError::Pretrained { path: path.to_path_buf(), reason: reason.into() }
}

pub fn load_safetensors_to_map(path: &Path) -> Result<HashMap<String, Tensor>> {
    let bytes = fs::read(path)?;
    let st = SafeTensors::deserialize(&bytes).map_err(|e| pretrained_err(path, e.to_string()))?;
    let mut map = HashMap::new();

    for name in st.names() {
        let tv = st.tensor(name).map_err(|e| pretrained_err(path, e.to_string()))?;
        let shape: Vec<i64> = tv.shape().iter().map(|&d| d as i64).collect();
        let data = tv.data();

        let t = match tv.dtype() {
            Dtype::F32 => Tensor::from_slice(&to_vec::<f32>(data)).reshape(&shape),
            Dtype::F16 => {
                let bits = to_vec::<u16>(data);
                let floats: Vec<f32> = bits.iter().map(|&h| f16::from_bits(h).to_f32()).collect();
                Tensor::from_slice(&floats).reshape(&shape)
            }
            Dtype::I64 => Tensor::from_slice(&to_vec::<i64>(data)).reshape(&shape).to_kind(Kind::Int64),
            Dtype::I32 => Tensor::from_slice(&to_vec::<i32>(data)).reshape(&shape).to_kind(Kind::Int),
            other => {
                debug!(tensor = %name, dtype = ?other, "skipping tensor with unsupported dtype");
                continue;
            }
        };
        map.insert(name.to_string(), t);
    }
    Ok(map)
}

// safetensors payloads are not guaranteed to be aligned for `T`
fn to_vec<T: bytemuck::Pod>(data: &[u8]) -> Vec<T> {
    match bytemuck::try_cast_slice::<u8, T>(data) {
        Ok(slice) => slice.to_vec(),
        Err(_) => data
            .chunks_exact(std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect(),
    }
}

// =============== KEY MAPPING ===============
fn block_idx_to_ij(mut k: usize) -> Option<(usize, usize)> {
    for (i, &(_t, _c, n, _s)) in STAGES.iter().enumerate() {
        if k < n as usize {
            return Some((i, k));
        }
        k -= n as usize;
    }
    None
}

fn map_timm_key(key: &str) -> Option<String> {
    if key == "conv_stem.weight" {
        return Some(format!("{BACKBONE}.stem.weight"));
    }
    if let Some(rest) = key.strip_prefix("bn1.") {
        return Some(format!("{BACKBONE}.stem.bn.{rest}"));
    }
    if key == "conv_head.weight" {
        return Some(format!("{BACKBONE}.last.weight"));
    }
    if let Some(rest) = key.strip_prefix("bn2.") {
        return Some(format!("{BACKBONE}.last.bn.{rest}"));
    }
    let rem = key.strip_prefix("blocks.")?;
    let mut it = rem.splitn(3, '.');
    let k: usize = it.next()?.parse().ok()?;
    if it.next()? != "conv" {
        return None;
    }
    let tail = it.next()?;
    let (i, j) = block_idx_to_ij(k)?;
    let target = |part: &str, sfx: &str| Some(format!("{BACKBONE}.ir_{i}_{j}.{part}.{sfx}"));
    if let Some(sfx) = tail.strip_prefix("pw.") {
        return target("expand", sfx);
    }
    if let Some(sfx) = tail.strip_prefix("pw_bn.") {
        return target("expand.bn", sfx);
    }
    if let Some(sfx) = tail.strip_prefix("dw.") {
        return target("dw", sfx);
    }
    if let Some(sfx) = tail.strip_prefix("dw_bn.") {
        return target("dw.bn", sfx);
    }
    if let Some(sfx) = tail.strip_prefix("pw_linear.") {
        return target("project", sfx);
    }
    if let Some(sfx) = tail.strip_prefix("pw_linear_bn.") {
        return target("project.bn", sfx);
    }
    None
}

#[derive(Clone, Copy)]
struct BlockShape {
    t: i64,
    hidden: i64,
}

fn block_shapes(alpha: f64) -> Vec<Vec<BlockShape>> {
    let mut out = Vec::new();
    let mut in_c = round_channels(32, alpha);
    for &(t, c, n, _s) in STAGES {
        let out_c = round_channels(c, alpha);
        let mut row = Vec::new();
        for _ in 0..n {
            row.push(BlockShape { t, hidden: in_c * t });
            in_c = out_c;
        }
        out.push(row);
    }
    out
}

fn map_blocks_ij_key(key: &str, shapes: &[Vec<BlockShape>], tensors: &HashMap<String, Tensor>) -> Option<String> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.len() < 4 || parts[0] != "blocks" {
        return None;
    }
    let i: usize = parts[1].parse().ok()?;
    let j: usize = parts[2].parse().ok()?;
    let tail = parts[3..].join(".");
    let b = *shapes.get(i)?.get(j)?;
    let block = format!("{BACKBONE}.ir_{i}_{j}");

    match tail.as_str() {
        "conv_dw.weight" => return Some(format!("{block}.dw.weight")),
        // with t == 1 the only pointwise conv is the projection
        "conv_pw.weight" => {
            let out_ch = tensors.get(key)?.size()[0];
            let part = if b.t != 1 && out_ch == b.hidden { "expand" } else { "project" };
            return Some(format!("{block}.{part}.weight"));
        }
        "conv_pw_1.weight" => return Some(format!("{block}.project.weight")),
        _ => {}
    }

    // t == 1: bn1 -> dw, bn2 -> project; otherwise bn1 -> expand, bn2 -> dw, bn3 -> project
    let (bn, rest) = tail.split_once('.')?;
    if rest == "num_batches_tracked" {
        return None;
    }
    let part = match (b.t == 1, bn) {
        (true, "bn1") => "dw",
        (true, "bn2") => "project",
        (false, "bn1") => "expand",
        (false, "bn2") => "dw",
        (false, "bn3") => "project",
        _ => return None,
    };
    Some(format!("{block}.{part}.bn.{rest}"))
}

/// Copies `src` into the variable `name` if it exists with the same shape.
pub(crate) fn try_copy(dst: &HashMap<String, Tensor>, name: &str, src: &Tensor) -> bool {
    match dst.get(name) {
        Some(d) if d.size() == src.size() => {
            tch::no_grad(|| {
                let mut d = d.shallow_clone();
                d.copy_(&src.to_kind(d.kind()));
            });
            true
        }
        _ => false,
    }
}

/// Loads backbone weights into `vs`; returns the number of tensors copied.
///
/// Fails if the file is unreadable or not a single tensor could be placed.
pub fn load_backbone_weights(vs: &nn::VarStore, alpha: f64, path: &Path) -> Result<usize> {
    let src = load_safetensors_to_map(path)?;
    let shapes = block_shapes(alpha);
    let targets = vs.variables();

    let prefix = format!("{BACKBONE}.");
    let has_own = src.keys().any(|k| k.starts_with(&prefix));
    let has_timm = src.contains_key("conv_stem.weight")
        || src.keys().any(|k| k.starts_with("blocks.") && k.contains(".conv."));
    let has_bij = src
        .keys()
        .any(|k| k.starts_with("blocks.") && k.matches('.').count() >= 3 && !k.contains(".conv."));

    let mut copied = 0usize;
    for (k, t) in src.iter() {
        let dst = if has_own {
            k.starts_with(&prefix).then(|| k.clone())
        } else if has_timm {
            map_timm_key(k)
        } else if has_bij {
            map_blocks_ij_key(k, &shapes, &src)
        } else {
            None
        };

        match dst {
            Some(name) if try_copy(&targets, &name, t) => copied += 1,
            Some(name) => debug!(source = %k, target = %name, "no matching variable"),
            None => {}
        }
    }

    if copied == 0 {
        warn!(path = %path.display(), "no backbone tensors matched");
        return Err(pretrained_err(path, "no tensors copied"));
    }
    Ok(copied)
}
