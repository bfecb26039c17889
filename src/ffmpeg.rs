use crate::error::MediaError;
use crate::timeline::{AssemblyMode, Timeline};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

const AUDIO_RATE: u32 = 44_100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub duration_s: f64,
    pub has_audio: bool,
}

/// Local media operations the generation flow needs after artifacts exist.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError>;

    /// Decode the first audio stream to mono f32 samples at `sample_rate`.
    async fn decode_mono(&self, path: &Path, sample_rate: u32) -> Result<Vec<f32>, MediaError>;

    /// Keep the first `duration_s` seconds of `input`, written losslessly.
    async fn cut_audio(&self, input: &Path, duration_s: f64, output: &Path) -> Result<(), MediaError>;

    async fn render(&self, timeline: &Timeline, output: &Path) -> Result<(), MediaError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FfmpegToolkit {
    pub settings: RenderSettings,
}

impl FfmpegToolkit {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }
}

async fn run_cmd(tool: &'static str, args: &[String]) -> Result<(), MediaError> {
    debug!(tool, ?args, "running");
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| MediaError::CommandFailed {
            tool,
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaError::CommandFailed {
            tool,
            detail: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

fn ffmpeg_base() -> Vec<String> {
    ["-y", "-hide_banner", "-loglevel", "error"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub async fn ffprobe_duration_seconds(path: &Path) -> Result<f64, MediaError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| MediaError::CommandFailed {
            tool: "ffprobe",
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(MediaError::CommandFailed {
            tool: "ffprobe",
            detail: format!("duration probe of {} failed", path.display()),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let duration = text.parse::<f64>().unwrap_or(-1.0);
    if !(duration.is_finite() && duration > 0.0) {
        return Err(MediaError::InvalidMedia(format!(
            "{} has invalid duration {text:?}",
            path.display()
        )));
    }
    Ok(duration)
}

pub async fn ffprobe_has_audio(path: &Path) -> Result<bool, MediaError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "a",
            "-show_entries",
            "stream=index",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .await
        .map_err(|e| MediaError::CommandFailed {
            tool: "ffprobe",
            detail: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(MediaError::CommandFailed {
            tool: "ffprobe",
            detail: format!("stream probe of {} failed", path.display()),
        });
    }
    Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
}

/// Interpret raw f32le bytes as samples.
pub fn samples_from_f32le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, MediaError> {
        Ok(MediaInfo {
            duration_s: ffprobe_duration_seconds(path).await?,
            has_audio: ffprobe_has_audio(path).await?,
        })
    }

    async fn decode_mono(&self, path: &Path, sample_rate: u32) -> Result<Vec<f32>, MediaError> {
        let raw = NamedTempFile::new()?;
        let mut args = ffmpeg_base();
        args.extend([
            "-i".to_string(),
            path.display().to_string(),
            "-vn".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            "-ar".to_string(),
            sample_rate.to_string(),
            "-f".to_string(),
            "f32le".to_string(),
            raw.path().display().to_string(),
        ]);
        run_cmd("ffmpeg", &args).await?;

        let bytes = tokio::fs::read(raw.path()).await?;
        if bytes.is_empty() {
            return Err(MediaError::InvalidMedia(format!(
                "{} has no decodable audio",
                path.display()
            )));
        }
        Ok(samples_from_f32le(&bytes))
    }

    async fn cut_audio(&self, input: &Path, duration_s: f64, output: &Path) -> Result<(), MediaError> {
        if !(duration_s.is_finite() && duration_s > 0.0) {
            return Err(MediaError::InvalidMedia(format!(
                "cannot cut {} to {duration_s}s",
                input.display()
            )));
        }
        let mut args = ffmpeg_base();
        args.extend([
            "-i".to_string(),
            input.display().to_string(),
            "-t".to_string(),
            format!("{:.3}", duration_s),
            "-c:a".to_string(),
            "pcm_s16le".to_string(),
            output.display().to_string(),
        ]);
        run_cmd("ffmpeg", &args).await
    }

    async fn render(&self, timeline: &Timeline, output: &Path) -> Result<(), MediaError> {
        let graph = build_filter_graph(timeline, &self.settings)?;

        let mut args = ffmpeg_base();
        for input in &graph.inputs {
            match input {
                RenderInput::File(path) => {
                    args.push("-i".to_string());
                    args.push(path.display().to_string());
                }
                RenderInput::Silence { duration_s } => {
                    args.extend([
                        "-f".to_string(),
                        "lavfi".to_string(),
                        "-t".to_string(),
                        format!("{duration_s:.3}"),
                        "-i".to_string(),
                        format!("anullsrc=r={AUDIO_RATE}:cl=stereo"),
                    ]);
                }
            }
        }
        args.extend([
            "-filter_complex".to_string(),
            graph.filter.clone(),
            "-map".to_string(),
            format!("[{}]", graph.video_label),
        ]);
        if let Some(label) = &graph.audio_label {
            args.extend([
                "-map".to_string(),
                format!("[{label}]"),
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                "192k".to_string(),
            ]);
        }
        args.extend([
            "-c:v".to_string(),
            "libx264".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-crf".to_string(),
            "22".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.display().to_string(),
        ]);

        info!(
            clips = timeline.clips.len(),
            duration_s = timeline.duration_s,
            output = %output.display(),
            "rendering timeline"
        );
        run_cmd("ffmpeg", &args).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderInput {
    File(PathBuf),
    /// Synthetic silent track for a clip that has no audio stream.
    Silence { duration_s: f64 },
}

#[derive(Debug, Clone)]
pub struct FilterGraph {
    pub inputs: Vec<RenderInput>,
    pub filter: String,
    pub video_label: String,
    pub audio_label: Option<String>,
}

/// Translate a timeline into an ffmpeg `filter_complex`: normalize every clip,
/// chain `xfade`/`acrossfade` (or `concat`), then apply the end fade.
pub fn build_filter_graph(timeline: &Timeline, settings: &RenderSettings) -> Result<FilterGraph, MediaError> {
    let n = timeline.clips.len();
    if n == 0 {
        return Err(MediaError::InvalidMedia("timeline has no clips".into()));
    }
    let with_audio = timeline.has_audio();
    let mut inputs: Vec<RenderInput> = timeline
        .clips
        .iter()
        .map(|c| RenderInput::File(c.path.clone()))
        .collect();
    let mut filters: Vec<String> = Vec::new();
    let (w, h, fps) = (settings.width, settings.height, settings.fps);

    for (i, clip) in timeline.clips.iter().enumerate() {
        filters.push(format!(
            "[{i}:v]trim=0:{d:.6},setpts=PTS-STARTPTS,scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,setsar=1,fps={fps},format=yuv420p[v{i}]",
            d = clip.duration_s
        ));
        if with_audio {
            let source = if clip.has_audio {
                format!("{i}:a")
            } else {
                inputs.push(RenderInput::Silence {
                    duration_s: clip.duration_s,
                });
                format!("{}:a", inputs.len() - 1)
            };
            filters.push(format!(
                "[{source}]atrim=0:{d:.6},asetpts=PTS-STARTPTS,aresample={AUDIO_RATE},aformat=channel_layouts=stereo[a{i}]",
                d = clip.duration_s
            ));
        }
    }

    let t = timeline.transition_s;
    let (mut video, mut audio) = ("v0".to_string(), with_audio.then(|| "a0".to_string()));

    if n > 1 && (timeline.mode == AssemblyMode::Simple || t <= 0.0) {
        let streams: String = (0..n)
            .map(|i| {
                if with_audio {
                    format!("[v{i}][a{i}]")
                } else {
                    format!("[v{i}]")
                }
            })
            .collect();
        if with_audio {
            filters.push(format!("{streams}concat=n={n}:v=1:a=1[vcat][acat]"));
            audio = Some("acat".to_string());
        } else {
            filters.push(format!("{streams}concat=n={n}:v=1:a=0[vcat]"));
        }
        video = "vcat".to_string();
    } else if n > 1 {
        let mut length = timeline.clips[0].duration_s;
        for i in 1..n {
            let offset = length - t;
            let v_out = format!("vx{i}");
            filters.push(format!(
                "[{video}][v{i}]xfade=transition=fade:duration={t:.6}:offset={offset:.6}[{v_out}]"
            ));
            video = v_out;
            if let Some(prev) = &audio {
                let a_out = format!("ax{i}");
                filters.push(format!("[{prev}][a{i}]acrossfade=d={t:.6}:c1=tri:c2=tri[{a_out}]"));
                audio = Some(a_out);
            }
            length += timeline.clips[i].duration_s - t;
        }
    }

    if let Some(fade) = timeline.end_fade {
        filters.push(format!(
            "[{video}]fade=t=out:st={:.6}:d={:.6}[vout]",
            fade.start_s, fade.duration_s
        ));
        video = "vout".to_string();
        if let (Some(prev), true) = (&audio, fade.audio) {
            filters.push(format!(
                "[{prev}]afade=t=out:st={:.6}:d={:.6}[aout]",
                fade.start_s, fade.duration_s
            ));
            audio = Some("aout".to_string());
        }
    }

    Ok(FilterGraph {
        inputs,
        filter: filters.join(";"),
        video_label: video,
        audio_label: audio,
    })
}
