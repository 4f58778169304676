//! SVG rendering of the training curves: a 2×2 grid with accuracy, loss,
//! precision and recall, train and validation per panel.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use super::metrics::{EpochRecord, History};
use crate::error::Result;

const PANEL_W: f64 = 480.0;
const PANEL_H: f64 = 320.0;
const MARGIN: f64 = 48.0;

const COLOR_TRAIN: &str = "#3498db";
const COLOR_VALID: &str = "#e67e22";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_PHASE: &str = "#95a5a6";

struct Panel {
    title: &'static str,
    train: fn(&EpochRecord) -> f64,
    valid: fn(&EpochRecord) -> f64,
}

fn panels() -> [Panel; 4] {
    [
        Panel { title: "Accuracy", train: |r| r.train.accuracy, valid: |r| r.valid.accuracy },
        Panel { title: "Loss", train: |r| r.train.loss, valid: |r| r.valid.loss },
        Panel { title: "Precision", train: |r| r.train.precision, valid: |r| r.valid.precision },
        Panel { title: "Recall", train: |r| r.train.recall, valid: |r| r.valid.recall },
    ]
}

pub fn render_svg(history: &History) -> String {
    let mut svg = String::new();
    let (w, h) = (PANEL_W * 2.0, PANEL_H * 2.0);
    let _ = writeln!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="sans-serif" font-size="12">"#
    );
    let _ = writeln!(svg, r#"<rect width="{w}" height="{h}" fill="white"/>"#);
    for (i, panel) in panels().iter().enumerate() {
        let ox = (i % 2) as f64 * PANEL_W;
        let oy = (i / 2) as f64 * PANEL_H;
        render_panel(&mut svg, history, panel, ox, oy);
    }
    svg.push_str("</svg>\n");
    svg
}

fn render_panel(svg: &mut String, history: &History, panel: &Panel, ox: f64, oy: f64) {
    let train = history.series(panel.train);
    let valid = history.series(panel.valid);
    let (x0, y0) = (ox + MARGIN, oy + MARGIN);
    let (pw, ph) = (PANEL_W - 2.0 * MARGIN, PANEL_H - 2.0 * MARGIN);

    let max = train.iter().chain(&valid).copied().fold(0.0_f64, f64::max);
    let y_max = if max > 1.0 { max * 1.05 } else { 1.0 };
    let n = train.len().max(2) - 1;
    let px = |i: usize| x0 + pw * i as f64 / n as f64;
    let py = |v: f64| y0 + ph - ph * (v / y_max).clamp(0.0, 1.0);

    let _ = writeln!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle" font-size="14" fill="{COLOR_AXIS}">{}</text>"#,
        x0 + pw / 2.0,
        oy + MARGIN / 2.0,
        panel.title
    );
    for k in 0..=4 {
        let v = y_max * k as f64 / 4.0;
        let y = py(v);
        let _ = writeln!(
            svg,
            r#"<line x1="{x0}" y1="{y}" x2="{}" y2="{y}" stroke="{COLOR_GRID}"/><text x="{}" y="{}" text-anchor="end" fill="{COLOR_AXIS}">{v:.2}</text>"#,
            x0 + pw,
            x0 - 6.0,
            y + 4.0
        );
    }
    let _ = writeln!(
        svg,
        r#"<polyline points="{x0},{y0} {x0},{} {},{}" fill="none" stroke="{COLOR_AXIS}"/>"#,
        y0 + ph,
        x0 + pw,
        y0 + ph
    );

    // dashed marker where fine-tuning starts
    if let Some(start) = history.epochs.iter().position(|r| r.phase != history.epochs[0].phase) {
        let x = px(start);
        let _ = writeln!(
            svg,
            r#"<line x1="{x}" y1="{y0}" x2="{x}" y2="{}" stroke="{COLOR_PHASE}" stroke-dasharray="4 4"/>"#,
            y0 + ph
        );
    }

    for (values, color, label, row) in [(&train, COLOR_TRAIN, "train", 0.0), (&valid, COLOR_VALID, "validation", 1.0)] {
        if values.is_empty() {
            continue;
        }
        let points: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(i, &v)| format!("{:.1},{:.1}", px(i), py(v)))
            .collect();
        let _ = writeln!(
            svg,
            r#"<polyline points="{}" fill="none" stroke="{color}" stroke-width="2"/>"#,
            points.join(" ")
        );
        let ly = y0 + 14.0 * row;
        let _ = writeln!(
            svg,
            r#"<text x="{}" y="{}" fill="{color}">{label}</text>"#,
            x0 + pw - 70.0,
            ly + 10.0
        );
    }
}

pub fn write_svg(history: &History, path: &Path) -> Result<()> {
    fs::write(path, render_svg(history))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::metrics::EpochMetrics;

    fn record(phase: &str, epoch: usize, acc: f64) -> EpochRecord {
        let m = EpochMetrics { loss: 1.0 - acc, accuracy: acc, precision: acc, recall: acc };
        EpochRecord { phase: phase.into(), epoch, learning_rate: 1e-3, train: m, valid: m }
    }

    #[test]
    fn draws_four_panels_with_two_series() {
        let mut h = History::default();
        h.push(record("head_only", 1, 0.6));
        h.push(record("head_only", 2, 0.7));
        h.push(record("fine_tune", 1, 0.8));
        let svg = render_svg(&h);
        assert!(svg.starts_with("<svg"));
        assert_eq!(svg.matches("stroke-width=\"2\"").count(), 8);
        assert_eq!(svg.matches("stroke-dasharray").count(), 4);
        for title in ["Accuracy", "Loss", "Precision", "Recall"] {
            assert!(svg.contains(title));
        }
    }

    #[test]
    fn empty_history_still_renders() {
        let svg = render_svg(&History::default());
        assert!(svg.trim_end().ends_with("</svg>"));
    }
}
