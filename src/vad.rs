//! Energy-based voice activity detection and end-of-speech trimming.
//!
//! Generated narration often ends in a clipped syllable or a long tail of
//! near-silence. The trimmer finds voiced regions from short-time RMS energy
//! and picks a cut point that never lands mid-word.

use crate::error::TrimError;
use serde::{Deserialize, Serialize};
use tracing::debug;

const ENERGY_EPSILON: f32 = 1e-10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// Normalized RMS above which a frame counts as voiced.
    pub energy_threshold: f32,
    /// Gaps shorter than this are bridged when merging segments.
    pub min_silence_s: f64,
    /// A trailing segment shorter than this is treated as a truncated artifact.
    pub min_complete_s: f64,
    pub end_padding_s: f64,
    /// Analysis window in samples.
    pub frame_length: usize,
    /// Window advance in samples; frames overlap when smaller than `frame_length`.
    pub hop_length: usize,
    /// Rate narration audio is decoded at before analysis.
    pub sample_rate: u32,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            min_silence_s: 0.5,
            min_complete_s: 0.5,
            end_padding_s: 0.1,
            frame_length: 1024,
            hop_length: 256,
            sample_rate: 16_000,
        }
    }
}

/// Voiced region in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSegment {
    pub start: f64,
    pub end: f64,
}

impl VoiceSegment {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimReason {
    /// Final segment long enough to be complete speech.
    KeptLastSegment,
    /// Final segment was a short fragment; cut after the one before it.
    RemovedIncompleteTail,
    /// Short lone segment, kept because there is nothing earlier to fall back to.
    OnlySegmentKept,
}

impl TrimReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrimReason::KeptLastSegment => "kept_last_segment",
            TrimReason::RemovedIncompleteTail => "removed_incomplete_tail",
            TrimReason::OnlySegmentKept => "only_segment_kept",
        }
    }
}

impl std::fmt::Display for TrimReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimDecision {
    pub cut_point_s: f64,
    pub reason: TrimReason,
    /// Merged voiced segments the decision was based on.
    pub segments: Vec<VoiceSegment>,
    pub source_duration_s: f64,
}

impl TrimDecision {
    /// Number of leading samples to keep at `sample_rate`.
    pub fn kept_samples(&self, sample_rate: u32) -> usize {
        (self.cut_point_s * f64::from(sample_rate)).round() as usize
    }

    pub fn removed_s(&self) -> f64 {
        (self.source_duration_s - self.cut_point_s).max(0.0)
    }
}

/// Analyze `waveform` (mono, full scale -1..1) and choose where to cut it.
pub fn trim(waveform: &[f32], sample_rate: u32, config: &TrimConfig) -> Result<TrimDecision, TrimError> {
    if sample_rate == 0 {
        return Err(TrimError::InvalidInput("sample rate must be positive".into()));
    }
    if config.hop_length == 0 || config.frame_length < config.hop_length {
        return Err(TrimError::InvalidInput(format!(
            "frame_length ({}) must be >= hop_length ({}) > 0",
            config.frame_length, config.hop_length
        )));
    }

    let sr = f64::from(sample_rate);
    let duration_s = waveform.len() as f64 / sr;

    let energies = frame_rms(waveform, config.frame_length, config.hop_length);
    let peak = energies.iter().copied().fold(0.0f32, f32::max);
    if peak < config.energy_threshold {
        // Nothing ever rises above the threshold, even before normalization.
        return Err(TrimError::NoVoiceDetected { duration_s });
    }

    let voiced: Vec<bool> = energies
        .iter()
        .map(|e| e / (peak + ENERGY_EPSILON) > config.energy_threshold)
        .collect();

    let raw = voiced_runs(&voiced, config.frame_length, config.hop_length, sr, duration_s);
    let segments = merge_segments(&raw, config.min_silence_s);

    debug!(
        frames = energies.len(),
        raw_segments = raw.len(),
        merged_segments = segments.len(),
        duration_s,
        "voice activity analysis"
    );

    decide_cut(segments, duration_s, config)
}

/// RMS energy per frame. Frames start every `hop` samples; the last ones
/// may be shorter than `frame_len`.
pub fn frame_rms(samples: &[f32], frame_len: usize, hop: usize) -> Vec<f32> {
    if samples.is_empty() || hop == 0 {
        return Vec::new();
    }
    (0..samples.len())
        .step_by(hop)
        .map(|start| {
            let end = (start + frame_len).min(samples.len());
            let frame = &samples[start..end];
            let sum_sq: f64 = frame.iter().map(|s| f64::from(*s) * f64::from(*s)).sum();
            (sum_sq / frame.len() as f64).sqrt() as f32
        })
        .collect()
}

/// Contiguous voiced frames as time ranges, clamped to the waveform length.
///
/// A frame stands for the hop-wide slice around its window centre, so a run
/// spans from half a hop before its first centre to half a hop after its last.
fn voiced_runs(
    voiced: &[bool],
    frame_len: usize,
    hop: usize,
    sr: f64,
    duration_s: f64,
) -> Vec<VoiceSegment> {
    let centre = |frame: usize| (frame * hop + frame_len / 2) as f64 / sr;
    let half_hop = hop as f64 / 2.0 / sr;
    let run = |first: usize, last: usize| {
        let start = (centre(first) - half_hop).clamp(0.0, duration_s);
        let end = (centre(last) + half_hop).clamp(start, duration_s);
        VoiceSegment::new(start, end)
    };
    let mut out = Vec::new();
    let mut run_start: Option<usize> = None;

    for (idx, is_voiced) in voiced.iter().enumerate() {
        match (run_start, *is_voiced) {
            (None, true) => run_start = Some(idx),
            (Some(start), false) => {
                out.push(run(start, idx - 1));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        out.push(VoiceSegment::new(run(start, start).start, duration_s));
    }
    out
}

/// Bridge gaps shorter than `min_silence_s`. Input must be sorted by start.
pub fn merge_segments(raw: &[VoiceSegment], min_silence_s: f64) -> Vec<VoiceSegment> {
    let mut merged: Vec<VoiceSegment> = Vec::with_capacity(raw.len());
    for seg in raw {
        match merged.last_mut() {
            Some(last) if seg.start - last.end < min_silence_s => {
                last.end = last.end.max(seg.end);
            }
            _ => merged.push(*seg),
        }
    }
    merged
}

/// Pick the cut point from merged segments.
pub fn decide_cut(
    segments: Vec<VoiceSegment>,
    duration_s: f64,
    config: &TrimConfig,
) -> Result<TrimDecision, TrimError> {
    let Some(last) = segments.last().copied() else {
        return Err(TrimError::NoVoiceDetected { duration_s });
    };

    let (end, reason) = if last.duration() >= config.min_complete_s {
        (last.end, TrimReason::KeptLastSegment)
    } else if segments.len() > 1 {
        (segments[segments.len() - 2].end, TrimReason::RemovedIncompleteTail)
    } else {
        (last.end, TrimReason::OnlySegmentKept)
    };

    let cut_point_s = (end + config.end_padding_s).min(duration_s);
    Ok(TrimDecision {
        cut_point_s,
        reason,
        segments,
        source_duration_s: duration_s,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: u32 = 16_000;

    fn fine_config() -> TrimConfig {
        TrimConfig {
            frame_length: 512,
            hop_length: 256,
            ..TrimConfig::default()
        }
    }

    /// Silence with 220 Hz tone bursts over the given voiced ranges.
    fn synth(total_s: f64, voiced: &[(f64, f64)]) -> Vec<f32> {
        let n = (total_s * f64::from(SR)) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / f64::from(SR);
                if voiced.iter().any(|(a, b)| t >= *a && t < *b) {
                    (0.5 * (2.0 * std::f64::consts::PI * 220.0 * t).sin()) as f32
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn approx(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn short_gap_merges_into_one_complete_segment() {
        let raw = vec![VoiceSegment::new(0.5, 3.0), VoiceSegment::new(3.4, 3.6)];
        let merged = merge_segments(&raw, 0.5);
        assert_eq!(merged, vec![VoiceSegment::new(0.5, 3.6)]);

        let decision = decide_cut(merged, 5.0, &TrimConfig::default()).unwrap();
        assert!(approx(decision.cut_point_s, 3.7, 1e-9));
        assert_eq!(decision.reason, TrimReason::KeptLastSegment);
    }

    #[test]
    fn short_trailing_fragment_is_removed() {
        let raw = vec![VoiceSegment::new(0.5, 3.0), VoiceSegment::new(3.6, 3.65)];
        let merged = merge_segments(&raw, 0.5);
        assert_eq!(merged.len(), 2);

        let decision = decide_cut(merged, 5.0, &TrimConfig::default()).unwrap();
        assert!(approx(decision.cut_point_s, 3.1, 1e-9));
        assert_eq!(decision.reason, TrimReason::RemovedIncompleteTail);
    }

    #[test]
    fn lone_short_segment_is_kept() {
        let decision =
            decide_cut(vec![VoiceSegment::new(1.0, 1.2)], 4.0, &TrimConfig::default()).unwrap();
        assert_eq!(decision.reason, TrimReason::OnlySegmentKept);
        assert!(approx(decision.cut_point_s, 1.3, 1e-9));
    }

    #[test]
    fn cut_point_is_clamped_to_length() {
        let decision =
            decide_cut(vec![VoiceSegment::new(0.0, 2.98)], 3.0, &TrimConfig::default()).unwrap();
        assert_eq!(decision.cut_point_s, 3.0);
    }

    #[test]
    fn merged_segments_are_sorted_and_disjoint() {
        let raw = vec![
            VoiceSegment::new(0.0, 0.4),
            VoiceSegment::new(0.5, 1.0),
            VoiceSegment::new(2.0, 2.5),
            VoiceSegment::new(2.6, 2.7),
            VoiceSegment::new(4.0, 4.2),
        ];
        let merged = merge_segments(&raw, 0.3);
        assert_eq!(merged.len(), 3);
        for pair in merged.windows(2) {
            assert!(pair[0].end < pair[1].start);
        }
    }

    #[test]
    fn waveform_with_short_gap_keeps_full_speech() {
        let wave = synth(5.0, &[(0.5, 3.0), (3.4, 3.6)]);
        let decision = trim(&wave, SR, &fine_config()).unwrap();
        assert_eq!(decision.segments.len(), 1);
        assert_eq!(decision.reason, TrimReason::KeptLastSegment);
        assert!(approx(decision.cut_point_s, 3.7, 0.05), "{}", decision.cut_point_s);
    }

    #[test]
    fn waveform_with_truncated_tail_cuts_before_it() {
        let wave = synth(5.0, &[(0.5, 3.0), (3.6, 3.65)]);
        let decision = trim(&wave, SR, &fine_config()).unwrap();
        assert_eq!(decision.segments.len(), 2);
        assert_eq!(decision.reason, TrimReason::RemovedIncompleteTail);
        assert!(approx(decision.cut_point_s, 3.1, 0.05), "{}", decision.cut_point_s);
    }

    #[test]
    fn silent_waveform_reports_no_voice() {
        let wave = vec![0.0f32; SR as usize * 2];
        assert!(matches!(
            trim(&wave, SR, &fine_config()),
            Err(TrimError::NoVoiceDetected { .. })
        ));
    }

    #[test]
    fn uniformly_quiet_waveform_reports_no_voice() {
        let wave: Vec<f32> = (0..SR as usize * 2)
            .map(|i| if i % 2 == 0 { 0.005 } else { -0.005 })
            .collect();
        let err = trim(&wave, SR, &fine_config()).unwrap_err();
        assert_eq!(err, TrimError::NoVoiceDetected { duration_s: 2.0 });
    }

    #[test]
    fn empty_waveform_reports_no_voice() {
        assert!(matches!(
            trim(&[], SR, &fine_config()),
            Err(TrimError::NoVoiceDetected { .. })
        ));
    }

    #[test]
    fn trimming_is_deterministic() {
        let wave = synth(4.0, &[(0.2, 1.5), (1.9, 2.0), (2.8, 3.6)]);
        let first = trim(&wave, SR, &fine_config()).unwrap();
        let second = trim(&wave, SR, &fine_config()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_sample_rate_is_invalid() {
        assert!(matches!(
            trim(&[0.1, 0.2], 0, &fine_config()),
            Err(TrimError::InvalidInput(_))
        ));
    }

    #[test]
    fn segment_edges_follow_window_centres() {
        // A 1024-sample window straddling the onset is voiced well before it.
        let wave = synth(4.0, &[(0.5, 3.0)]);
        let decision = trim(&wave, SR, &TrimConfig::default()).unwrap();
        let seg = decision.segments[0];
        assert!(approx(seg.start, 0.5, 0.03), "{}", seg.start);
        assert!(approx(seg.end, 3.0, 0.04), "{}", seg.end);
    }

    #[test]
    fn kept_samples_rounds_cut_point() {
        let decision =
            decide_cut(vec![VoiceSegment::new(0.0, 1.0)], 2.0, &TrimConfig::default()).unwrap();
        assert_eq!(decision.kept_samples(SR), 17_600);
    }
}
