//! Crossfade timeline assembly.
//!
//! Pure arithmetic over measured clip durations: the resulting `Timeline`
//! tells the renderer which region of every clip is played when, and where
//! adjacent clips overlap.

use crate::clip::{ClipOutcome, ClipResult};
use crate::error::AssemblyError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyMode {
    /// Plain concatenation, no overlap.
    Simple,
    #[default]
    Crossfade,
}

impl AssemblyMode {
    pub fn min_clips(self) -> usize {
        match self {
            AssemblyMode::Simple => 1,
            AssemblyMode::Crossfade => 2,
        }
    }
}

/// A clip as the timeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineClip {
    pub index: usize,
    pub path: PathBuf,
    pub duration_s: f64,
    pub has_audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineSegment {
    /// A clip region played on its own.
    Clip {
        clip: usize,
        source_start_s: f64,
        source_end_s: f64,
        timeline_start_s: f64,
    },
    /// Tail of `from` fading out over the head of `to`.
    Crossfade {
        from: usize,
        to: usize,
        timeline_start_s: f64,
        duration_s: f64,
    },
}

impl TimelineSegment {
    pub fn duration_s(&self) -> f64 {
        match self {
            TimelineSegment::Clip {
                source_start_s,
                source_end_s,
                ..
            } => source_end_s - source_start_s,
            TimelineSegment::Crossfade { duration_s, .. } => *duration_s,
        }
    }

    pub fn timeline_start_s(&self) -> f64 {
        match self {
            TimelineSegment::Clip { timeline_start_s, .. }
            | TimelineSegment::Crossfade { timeline_start_s, .. } => *timeline_start_s,
        }
    }
}

/// Fade to black (and silence, when there is audio) over the last seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndFade {
    pub start_s: f64,
    pub duration_s: f64,
    pub audio: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub mode: AssemblyMode,
    pub clips: Vec<TimelineClip>,
    pub segments: Vec<TimelineSegment>,
    /// Transition actually used after clamping.
    pub transition_s: f64,
    pub end_fade: Option<EndFade>,
    pub duration_s: f64,
}

impl Timeline {
    pub fn has_audio(&self) -> bool {
        self.clips.iter().any(|c| c.has_audio)
    }
}

/// Clamp the requested transition to half of the shortest clip so no
/// transition eats more than a clip's own runtime. Applies to every pair.
pub fn effective_transition(requested_s: f64, durations: &[f64]) -> f64 {
    let shortest = durations.iter().copied().fold(f64::INFINITY, f64::min);
    if !shortest.is_finite() {
        return 0.0;
    }
    requested_s.max(0.0).min(shortest / 2.0)
}

/// Build a timeline from successful clip results in spec order.
pub fn assemble(
    clips: &[ClipResult],
    transition_s: f64,
    end_fade_s: f64,
    mode: AssemblyMode,
) -> Result<Timeline, AssemblyError> {
    let inputs = validate_inputs(clips, mode)?;
    let durations: Vec<f64> = inputs.iter().map(|c| c.duration_s).collect();

    let (segments, transition_s) = match mode {
        AssemblyMode::Simple => (simple_segments(&inputs), 0.0),
        AssemblyMode::Crossfade => {
            let t = effective_transition(transition_s, &durations);
            if t < transition_s {
                info!(
                    requested = transition_s,
                    effective = t,
                    "transition clamped to half the shortest clip"
                );
            }
            (crossfade_segments(&inputs, t), t)
        }
    };

    let duration_s: f64 = segments.iter().map(TimelineSegment::duration_s).sum();
    let has_audio = inputs.iter().any(|c| c.has_audio);
    let end_fade = (end_fade_s > 0.0 && duration_s > 0.0).then(|| {
        let fade = end_fade_s.min(duration_s);
        EndFade {
            start_s: duration_s - fade,
            duration_s: fade,
            audio: has_audio,
        }
    });

    debug!(
        clips = inputs.len(),
        segments = segments.len(),
        transition_s,
        duration_s,
        "timeline assembled"
    );

    Ok(Timeline {
        mode,
        clips: inputs,
        segments,
        transition_s,
        end_fade,
        duration_s,
    })
}

fn validate_inputs(clips: &[ClipResult], mode: AssemblyMode) -> Result<Vec<TimelineClip>, AssemblyError> {
    if clips.len() < mode.min_clips() {
        return Err(AssemblyError::ContractViolation(format!(
            "{mode:?} assembly needs at least {} clips, got {}",
            mode.min_clips(),
            clips.len()
        )));
    }

    let mut out = Vec::with_capacity(clips.len());
    for clip in clips {
        match &clip.outcome {
            ClipOutcome::Success {
                artifact,
                duration_s,
                has_audio,
            } => {
                if !(duration_s.is_finite() && *duration_s > 0.0) {
                    return Err(AssemblyError::ContractViolation(format!(
                        "clip {} has non-positive duration {duration_s}",
                        clip.index
                    )));
                }
                out.push(TimelineClip {
                    index: clip.index,
                    path: artifact.local_path.clone(),
                    duration_s: *duration_s,
                    has_audio: *has_audio,
                });
            }
            ClipOutcome::Failed { message, .. } => {
                return Err(AssemblyError::ContractViolation(format!(
                    "failed clip {} reached the assembler: {message}",
                    clip.index
                )));
            }
        }
    }

    if out.windows(2).any(|w| w[0].index >= w[1].index) {
        return Err(AssemblyError::ContractViolation(
            "clips are not in spec order".to_string(),
        ));
    }
    Ok(out)
}

fn simple_segments(clips: &[TimelineClip]) -> Vec<TimelineSegment> {
    let mut at = 0.0;
    clips
        .iter()
        .map(|c| {
            let seg = TimelineSegment::Clip {
                clip: c.index,
                source_start_s: 0.0,
                source_end_s: c.duration_s,
                timeline_start_s: at,
            };
            at += c.duration_s;
            seg
        })
        .collect()
}

fn crossfade_segments(clips: &[TimelineClip], t: f64) -> Vec<TimelineSegment> {
    let last = clips.len() - 1;
    let mut segments = Vec::with_capacity(clips.len() * 2);
    let mut at = 0.0;

    for (pos, c) in clips.iter().enumerate() {
        let head = if pos > 0 { t } else { 0.0 };
        let tail = if pos < last { t } else { 0.0 };
        let solo = TimelineSegment::Clip {
            clip: c.index,
            source_start_s: head,
            source_end_s: c.duration_s - tail,
            timeline_start_s: at,
        };
        at += solo.duration_s();
        segments.push(solo);

        if pos < last && t > 0.0 {
            segments.push(TimelineSegment::Crossfade {
                from: c.index,
                to: clips[pos + 1].index,
                timeline_start_s: at,
                duration_s: t,
            });
            at += t;
        }
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{ClipArtifact, ClipErrorKind};
    use rand::{Rng, SeedableRng};

    fn ok(index: usize, duration_s: f64) -> ClipResult {
        ClipResult::success(
            index,
            1,
            ClipArtifact {
                local_path: PathBuf::from(format!("clip_{index}.mp4")),
                blob_url: None,
            },
            duration_s,
            true,
        )
    }

    fn clips(durations: &[f64]) -> Vec<ClipResult> {
        durations.iter().enumerate().map(|(i, d)| ok(i, *d)).collect()
    }

    #[test]
    fn three_clip_crossfade_duration() {
        let tl = assemble(&clips(&[8.0, 10.0, 9.0]), 1.0, 0.5, AssemblyMode::Crossfade).unwrap();
        assert!((tl.duration_s - 25.0).abs() < 1e-9);
        assert_eq!(tl.segments.len(), 5);
        assert_eq!(tl.transition_s, 1.0);
    }

    #[test]
    fn interior_clips_are_trimmed_on_both_sides() {
        let tl = assemble(&clips(&[8.0, 10.0, 9.0]), 1.0, 0.0, AssemblyMode::Crossfade).unwrap();
        let solo: Vec<(f64, f64)> = tl
            .segments
            .iter()
            .filter_map(|s| match s {
                TimelineSegment::Clip {
                    source_start_s,
                    source_end_s,
                    ..
                } => Some((*source_start_s, *source_end_s)),
                _ => None,
            })
            .collect();
        assert_eq!(solo, vec![(0.0, 7.0), (1.0, 9.0), (1.0, 9.0)]);
    }

    #[test]
    fn segments_are_contiguous() {
        let tl = assemble(&clips(&[4.0, 6.5, 3.0, 7.25]), 1.2, 1.0, AssemblyMode::Crossfade).unwrap();
        let mut at = 0.0;
        for seg in &tl.segments {
            assert!((seg.timeline_start_s() - at).abs() < 1e-9);
            at += seg.duration_s();
        }
        assert!((at - tl.duration_s).abs() < 1e-9);
    }

    #[test]
    fn duration_invariant_over_random_clip_sets() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let n = rng.gen_range(2..12);
            let durations: Vec<f64> = (0..n).map(|_| rng.gen_range(0.5..20.0)).collect();
            let shortest = durations.iter().copied().fold(f64::INFINITY, f64::min);
            let t = rng.gen_range(0.0..=shortest / 2.0);

            let tl = assemble(&clips(&durations), t, 1.0, AssemblyMode::Crossfade).unwrap();
            let expected = durations.iter().sum::<f64>() - (n as f64 - 1.0) * t;
            assert!((tl.duration_s - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn transition_is_clamped_uniformly() {
        let tl = assemble(&clips(&[10.0, 2.0, 10.0]), 3.0, 0.0, AssemblyMode::Crossfade).unwrap();
        assert_eq!(tl.transition_s, 1.0);
        assert!((tl.duration_s - 20.0).abs() < 1e-9);
        assert!(
            tl.segments
                .iter()
                .filter(|s| matches!(s, TimelineSegment::Crossfade { .. }))
                .all(|s| s.duration_s() == 1.0)
        );
    }

    #[test]
    fn simple_mode_concatenates_exactly() {
        let tl = assemble(&clips(&[3.5]), 1.0, 0.0, AssemblyMode::Simple).unwrap();
        assert_eq!(tl.duration_s, 3.5);

        let tl = assemble(&clips(&[3.5, 2.0, 4.0]), 1.0, 0.0, AssemblyMode::Simple).unwrap();
        assert!((tl.duration_s - 9.5).abs() < 1e-9);
        assert_eq!(tl.transition_s, 0.0);
        assert!(tl.end_fade.is_none());
    }

    #[test]
    fn end_fade_covers_the_tail_of_the_whole_timeline() {
        let tl = assemble(&clips(&[8.0, 10.0, 9.0]), 1.0, 1.5, AssemblyMode::Crossfade).unwrap();
        let fade = tl.end_fade.unwrap();
        assert!((fade.start_s - 23.5).abs() < 1e-9);
        assert_eq!(fade.duration_s, 1.5);
        assert!(fade.audio);
    }

    #[test]
    fn crossfade_rejects_a_single_clip() {
        let err = assemble(&clips(&[5.0]), 1.0, 0.0, AssemblyMode::Crossfade).unwrap_err();
        assert!(matches!(err, AssemblyError::ContractViolation(_)));
    }

    #[test]
    fn failed_clip_is_a_contract_violation() {
        let mut input = clips(&[5.0, 5.0]);
        input.push(ClipResult::failed(2, 3, ClipErrorKind::Transient, "timeout"));
        let err = assemble(&input, 1.0, 0.0, AssemblyMode::Crossfade).unwrap_err();
        assert!(err.to_string().contains("failed clip 2"));
    }

    #[test]
    fn out_of_order_clips_are_rejected() {
        let input = vec![ok(1, 5.0), ok(0, 5.0)];
        assert!(assemble(&input, 1.0, 0.0, AssemblyMode::Crossfade).is_err());
    }
}
