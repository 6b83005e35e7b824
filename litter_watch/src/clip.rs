// THEORY:
// Incident clips are rendered from a ring-buffer snapshot into a playable video
// container. Rendering is the most expensive step of evidence collection (a full
// buffer is several hundred frames to encode), so the assembler only plans the
// clip as a `ClipJob` and the dispatcher renders it off the camera thread.
//
// Key architectural principles:
// 1.  **Snapshot In, File Out**: A job owns cheap `Arc` handles to the frames it
//     renders. Nothing the camera does afterwards can change the clip.
// 2.  **Real Timing**: The frame rate comes from the frames' own capture times,
//     so a clip plays back at the speed it was recorded. The configured rate is
//     only a fallback for clips too short to measure.
// 3.  **Codec Fallback**: Writers are tried in order (mp4v, avc1, MJPG) and the
//     first one the local OpenCV build can open wins.

use crate::error::{Error, Result};
use crate::frame::Frame;
use opencv::core::{CV_8UC3, Mat, Scalar, Size, StsError};
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::VideoWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MIN_FPS: f64 = 1.0;
const MAX_FPS: f64 = 120.0;

/// A clip waiting to be rendered.
#[derive(Debug, Clone)]
pub struct ClipJob {
    pub path: PathBuf,
    /// Ring buffer snapshot, oldest first.
    pub frames: Vec<Frame>,
    pub fps: f64,
}

impl ClipJob {
    pub fn new(path: PathBuf, frames: Vec<Frame>, fallback_fps: f64) -> Self {
        let fps = measured_fps(&frames, fallback_fps);
        Self { path, frames, fps }
    }

    /// Encodes the frames and returns how many were written.
    pub fn render(&self) -> Result<usize> {
        write_clip(&self.frames, &self.path, self.fps)
    }
}

/// Frame rate implied by the capture times of `frames`, or `fallback` when
/// there are fewer than two frames or they share a timestamp.
pub fn measured_fps(frames: &[Frame], fallback: f64) -> f64 {
    let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
        return fallback;
    };
    let span = last.captured_at.saturating_duration_since(first.captured_at).as_secs_f64();
    if frames.len() < 2 || span <= 0.0 {
        return fallback;
    }
    ((frames.len() - 1) as f64 / span).clamp(MIN_FPS, MAX_FPS)
}

/// Writes `frames` in order to a video file at `path`.
///
/// Frames whose size differs from the first one are skipped.
pub fn write_clip(frames: &[Frame], path: &Path, fps: f64) -> Result<usize> {
    let Some(first) = frames.first() else {
        return Err(Error::EmptyBuffer);
    };
    let filename = path
        .to_str()
        .ok_or_else(|| opencv::Error::new(StsError, format!("clip path is not UTF-8: {}", path.display())))?;
    let size = Size::new(first.width as i32, first.height as i32);
    let mut writer = open_writer(filename, fps, size)?;

    let mut written = 0;
    for frame in frames {
        if (frame.width, frame.height) != (first.width, first.height) {
            warn!(frame = frame.index, "Frame size changed mid-clip, skipped");
            continue;
        }
        writer.write(&to_bgr_mat(frame)?)?;
        written += 1;
    }
    writer.release()?;
    debug!(path = %path.display(), frames = written, fps, "Clip written");
    Ok(written)
}

fn open_writer(filename: &str, fps: f64, size: Size) -> Result<VideoWriter> {
    let codecs = [
        VideoWriter::fourcc('m', 'p', '4', 'v')?,
        VideoWriter::fourcc('a', 'v', 'c', '1')?,
        VideoWriter::fourcc('M', 'J', 'P', 'G')?,
    ];
    for codec in codecs {
        let writer = VideoWriter::new(filename, codec, fps, size, true)?;
        if writer.is_opened()? {
            return Ok(writer);
        }
    }
    Err(opencv::Error::new(StsError, format!("no video codec could open {filename}")).into())
}

/// Copies RGB pixels into an OpenCV BGR matrix.
fn to_bgr_mat(frame: &Frame) -> Result<Mat> {
    let mut rgb = Mat::new_rows_cols_with_default(frame.height as i32, frame.width as i32, CV_8UC3, Scalar::all(0.0))?;
    rgb.data_bytes_mut()?.copy_from_slice(frame.data());
    let mut bgr = Mat::default();
    imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Vec3b;
    use opencv::videoio::{self, VideoCapture};
    use std::time::{Duration, Instant};

    fn frames(count: u64, interval: Duration) -> Vec<Frame> {
        let t0 = Instant::now();
        (0..count)
            .map(|i| Frame::solid(i, 64, 64, t0 + interval * i as u32, [(60 + i * 30) as u8, 0, 0]))
            .collect()
    }

    #[test]
    fn fps_follows_capture_times() {
        assert_eq!(measured_fps(&frames(11, Duration::from_millis(100)), 30.0), 10.0);
        assert_eq!(measured_fps(&frames(1, Duration::from_millis(100)), 30.0), 30.0);
        assert_eq!(measured_fps(&frames(4, Duration::ZERO), 25.0), 25.0);
    }

    #[test]
    fn clip_is_playable_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let job = ClipJob::new(dir.path().join("clip.mp4"), frames(5, Duration::from_millis(100)), 30.0);
        assert_eq!(job.render().unwrap(), 5);

        let mut capture = VideoCapture::from_file(job.path.to_str().unwrap(), videoio::CAP_ANY).unwrap();
        assert!(capture.is_opened().unwrap());
        let mut reds = Vec::new();
        let mut mat = Mat::default();
        while capture.read(&mut mat).unwrap() && !mat.empty() {
            reds.push(mat.at_2d::<Vec3b>(32, 32).unwrap()[2]);
        }
        assert_eq!(reds.len(), 5);
        for pair in reds.windows(2) {
            assert!(pair[0] < pair[1], "frames out of order: {reds:?}");
        }
    }

    #[test]
    fn empty_clip_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_clip(&[], &dir.path().join("x.mp4"), 30.0).unwrap_err();
        assert!(matches!(err, Error::EmptyBuffer));
    }
}
