//! Labels, thresholding and the persisted class mapping.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ClassDirs;

/// The two classes the detector distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    #[serde(rename = "LIGHTS ON")]
    LightsOn,
    #[serde(rename = "LIGHTS OFF")]
    LightsOff,
}

impl Label {
    pub fn as_str(self) -> &'static str {
        match self {
            Label::LightsOn => "LIGHTS ON",
            Label::LightsOff => "LIGHTS OFF",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A thresholded score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub label: Label,
    /// Percentage in `[0, 100]`.
    pub confidence: f64,
}

impl Decision {
    /// `score` is the probability of [`Label::LightsOn`].
    ///
    /// `score >= threshold` gives `LightsOn` with confidence `score * 100`,
    /// anything below gives `LightsOff` with confidence `(1 - score) * 100`.
    pub fn from_score(score: f64, threshold: f64) -> Self {
        if score >= threshold {
            Decision { label: Label::LightsOn, confidence: score * 100.0 }
        } else {
            Decision { label: Label::LightsOff, confidence: (1.0 - score) * 100.0 }
        }
    }
}

/// Which directory and label sit behind output index 0 and 1.
///
/// Stored in the model manifest so the mapping never depends on a
/// directory listing at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMap {
    /// `classes[i]` is the label trained as target `i`.
    pub classes: [Label; 2],
    /// Source directory names, same order as `classes`.
    pub dirs: [String; 2],
}

impl ClassMap {
    /// lights_off = 0, lights_on = 1.
    pub fn from_dirs(dirs: &ClassDirs) -> Self {
        Self {
            classes: [Label::LightsOff, Label::LightsOn],
            dirs: [dirs.lights_off.clone(), dirs.lights_on.clone()],
        }
    }

    pub fn target(&self, label: Label) -> f32 {
        if self.classes[1] == label { 1.0 } else { 0.0 }
    }

    /// Converts the sigmoid output (probability of index 1) into the
    /// probability of lights being on.
    pub fn lights_on_score(&self, output: f64) -> f64 {
        match self.classes[1] {
            Label::LightsOn => output,
            Label::LightsOff => 1.0 - output,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.classes[0] != self.classes[1]
    }
}

impl Default for ClassMap {
    fn default() -> Self {
        Self::from_dirs(&ClassDirs::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn scenarios() {
        let d = Decision::from_score(0.82, 0.5);
        assert_eq!(d.label, Label::LightsOn);
        assert!(close(d.confidence, 82.0));

        let d = Decision::from_score(0.3, 0.5);
        assert_eq!(d.label, Label::LightsOff);
        assert!(close(d.confidence, 70.0));

        let d = Decision::from_score(0.82, 0.9);
        assert_eq!(d.label, Label::LightsOff);
        assert!(close(d.confidence, 18.0));
    }

    #[test]
    fn boundary_is_on() {
        let d = Decision::from_score(0.5, 0.5);
        assert_eq!(d.label, Label::LightsOn);
        assert!(close(d.confidence, 50.0));
    }

    #[test]
    fn confidence_at_half_threshold_is_at_least_fifty() {
        for i in 0..=100 {
            let s = i as f64 / 100.0;
            let d = Decision::from_score(s, 0.5);
            assert!(d.confidence >= 50.0 - 1e-9 && d.confidence <= 100.0 + 1e-9, "s={s}");
            assert_eq!(d.label == Label::LightsOn, s >= 0.5);
        }
    }

    #[test]
    fn label_flips_once_at_score() {
        let s = 0.37;
        let mut flips = 0;
        let mut prev = Decision::from_score(s, 0.0).label;
        for i in 1..=1000 {
            let t = i as f64 / 1000.0;
            let label = Decision::from_score(s, t).label;
            if label != prev {
                flips += 1;
                assert_eq!(label, Label::LightsOff);
                assert!(t > s && t - 0.001 <= s + 1e-9);
            }
            prev = label;
        }
        assert_eq!(flips, 1);
    }

    #[test]
    fn serializes_display_names() {
        assert_eq!(serde_json::to_string(&Label::LightsOn).unwrap(), "\"LIGHTS ON\"");
        assert_eq!(Label::LightsOff.to_string(), "LIGHTS OFF");
    }

    #[test]
    fn inverted_map_flips_score() {
        let map = ClassMap {
            classes: [Label::LightsOn, Label::LightsOff],
            dirs: ["on".into(), "off".into()],
        };
        assert!(close(map.lights_on_score(0.25), 0.75));
        assert_eq!(map.target(Label::LightsOn), 0.0);
        assert!(close(ClassMap::default().lights_on_score(0.25), 0.25));
        assert_eq!(ClassMap::default().target(Label::LightsOn), 1.0);
    }
}
