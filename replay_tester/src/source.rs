use litter_watch::{Error, Frame, FrameSource, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Replays a directory of still images, in file name order, as a camera feed.
///
/// Capture times are synthesized from `fps` so a replay tracks the same way
/// no matter how fast the machine decodes.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
    start: Instant,
    frame_interval: Duration,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: f64) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            return Err(Error::SourceExhausted(format!("no images in {}", dir.display())));
        }
        Ok(Self {
            paths,
            next: 0,
            start: Instant::now(),
            frame_interval: Duration::from_secs_f64(1.0 / fps.max(1.0)),
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        let image = image::open(path)?.to_rgb8();
        let index = self.next as u64;
        self.next += 1;
        let captured_at = self.start + self.frame_interval * index as u32;
        Ok(Some(Frame::from_image(index, captured_at, image)))
    }
}
