//! Frame pipeline: single-slot delivery, asynchronous decode, presentation.
//!
//! Decodes run on the blocking pool and finish in whatever order they
//! finish; a newer frame may be presented before an older one. That trade is
//! accepted for latency and is not corrected here.

use bytes::Bytes;
use image::RgbaImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::telemetry::{PerfGuard, Probe};

/// Latest frame received from the server. Only one is ever retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub payload: Bytes,
    pub sequence_id: u64,
    pub generation_time_ms: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub sequence_id: u64,
    pub image: RgbaImage,
}

impl DecodedFrame {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame {sequence_id} could not be decoded: {reason}")]
    Decode { sequence_id: u64, reason: String },
    #[error("frame decoder stopped: {0}")]
    Join(String),
}

/// Where decoded frames end up. The surface owns any scaling or drawing.
pub trait PresentationSurface: Send {
    fn resize(&mut self, width: u32, height: u32);
    fn blit(&mut self, frame: &DecodedFrame);
}

/// Receives each decode result with the tag it was submitted under.
pub type DecodeSink = Arc<dyn Fn(u64, Result<DecodedFrame, FrameError>) + Send + Sync>;

/// Frames presented during the last complete wall-clock second.
#[derive(Debug, Clone)]
pub struct FrameRateCounter {
    window_start: Option<Instant>,
    in_window: u32,
    fps: u32,
}

impl FrameRateCounter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self {
            window_start: None,
            in_window: 0,
            fps: 0,
        }
    }

    pub fn record(&mut self, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        if now.saturating_duration_since(start) >= Self::WINDOW {
            self.fps = self.fps(now);
            self.in_window = 0;
            self.window_start = Some(now);
        }
        self.in_window += 1;
    }

    /// Rate as of `now`. Falls to zero once a full window passes without a
    /// frame, whether or not another frame ever arrives.
    pub fn fps(&self, now: Instant) -> u32 {
        let Some(start) = self.window_start else {
            return 0;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= Self::WINDOW * 2 {
            0
        } else if elapsed >= Self::WINDOW {
            self.in_window
        } else {
            self.fps
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for FrameRateCounter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FramePipeline {
    surface: Option<Box<dyn PresentationSurface>>,
    dimensions: Option<(u32, u32)>,
    rate: FrameRateCounter,
    sink: DecodeSink,
    presented: u64,
}

impl FramePipeline {
    pub fn new(sink: DecodeSink) -> Self {
        Self {
            surface: None,
            dimensions: None,
            rate: FrameRateCounter::new(),
            sink,
            presented: 0,
        }
    }

    pub fn register_surface(&mut self, surface: Box<dyn PresentationSurface>) {
        self.surface = Some(surface);
        self.dimensions = None;
    }

    pub fn unregister_surface(&mut self) -> Option<Box<dyn PresentationSurface>> {
        self.dimensions = None;
        self.surface.take()
    }

    pub fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    /// Starts decoding `frame`; the result goes to the decode sink along
    /// with `tag`.
    pub fn submit(&self, frame: &Frame, tag: u64) {
        let sink = self.sink.clone();
        let payload = frame.payload.clone();
        let sequence_id = frame.sequence_id;
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || decode(sequence_id, &payload))
                .await
                .unwrap_or_else(|err| Err(FrameError::Join(err.to_string())));
            sink(tag, result);
        });
    }

    /// Shows a decoded frame, resizing the surface only when its size changed.
    pub fn present(&mut self, frame: &DecodedFrame, now: Instant) -> bool {
        let Some(surface) = self.surface.as_mut() else {
            trace!(target: "biome::frame", seq = frame.sequence_id, "no surface, frame dropped");
            return false;
        };
        let dimensions = frame.dimensions();
        if self.dimensions != Some(dimensions) {
            debug!(
                target: "biome::frame",
                width = dimensions.0,
                height = dimensions.1,
                "resizing presentation surface"
            );
            surface.resize(dimensions.0, dimensions.1);
            self.dimensions = Some(dimensions);
        }
        surface.blit(frame);
        self.rate.record(now);
        self.presented += 1;
        true
    }

    pub fn fps(&self, now: Instant) -> u32 {
        self.rate.fps(now)
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn reset_stats(&mut self) {
        self.rate.reset();
        self.presented = 0;
    }
}

/// Decodes an encoded image (JPEG from the engine, PNG accepted) to RGBA.
pub fn decode(sequence_id: u64, payload: &[u8]) -> Result<DecodedFrame, FrameError> {
    let _guard = PerfGuard::new(Probe::FrameDecode);
    let image = image::load_from_memory(payload).map_err(|err| FrameError::Decode {
        sequence_id,
        reason: err.to_string(),
    })?;
    Ok(DecodedFrame {
        sequence_id,
        image: image.to_rgba8(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageOutputFormat, Rgba};
    use std::io::Cursor;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[derive(Clone, Default)]
    struct RecordingSurface {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PresentationSurface for RecordingSurface {
        fn resize(&mut self, width: u32, height: u32) {
            self.log.lock().unwrap().push(format!("resize {width}x{height}"));
        }

        fn blit(&mut self, frame: &DecodedFrame) {
            self.log.lock().unwrap().push(format!("blit {}", frame.sequence_id));
        }
    }

    fn decoded(sequence_id: u64, width: u32, height: u32) -> DecodedFrame {
        DecodedFrame {
            sequence_id,
            image: RgbaImage::new(width, height),
        }
    }

    #[test]
    fn decodes_png_payload() {
        let frame = decode(3, &png(4, 2)).unwrap();
        assert_eq!(frame.sequence_id, 3);
        assert_eq!(frame.dimensions(), (4, 2));
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let err = decode(9, b"definitely not a jpeg").unwrap_err();
        assert!(matches!(err, FrameError::Decode { sequence_id: 9, .. }));
    }

    #[test]
    fn resizes_only_when_dimensions_change() {
        let surface = RecordingSurface::default();
        let log = surface.log.clone();
        let mut pipeline = FramePipeline::new(Arc::new(|_, _| {}));
        let now = Instant::now();

        assert!(!pipeline.present(&decoded(0, 8, 8), now));
        pipeline.register_surface(Box::new(surface));
        assert!(pipeline.present(&decoded(1, 8, 8), now));
        assert!(pipeline.present(&decoded(2, 8, 8), now));
        assert!(pipeline.present(&decoded(3, 16, 9), now));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["resize 8x8", "blit 1", "blit 2", "resize 16x9", "blit 3"]
        );
        assert_eq!(pipeline.presented(), 3);
    }

    #[test]
    fn frame_rate_counts_previous_second() {
        let mut counter = FrameRateCounter::new();
        let start = Instant::now();
        for i in 0..30 {
            counter.record(start + Duration::from_millis(i * 33));
        }
        assert_eq!(counter.fps(start + Duration::from_millis(990)), 0);
        counter.record(start + Duration::from_millis(1_000));
        assert_eq!(counter.fps(start + Duration::from_millis(1_000)), 30);
        counter.record(start + Duration::from_millis(5_000));
        assert_eq!(counter.fps(start + Duration::from_millis(5_000)), 0);
    }

    #[test]
    fn frame_rate_decays_when_frames_stop() {
        let mut counter = FrameRateCounter::new();
        let start = Instant::now();
        for i in 0..=60 {
            counter.record(start + Duration::from_millis(i * 20));
        }
        let last = start + Duration::from_millis(1_200);
        assert_eq!(counter.fps(last), 50);
        assert_eq!(counter.fps(last + Duration::from_millis(500)), 50);
        // The window holding the last frames completes with 11 in it.
        assert_eq!(counter.fps(start + Duration::from_millis(2_100)), 11);
        assert_eq!(counter.fps(start + Duration::from_secs(3)), 0);
        assert_eq!(counter.fps(start + Duration::from_secs(60)), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn submit_reports_decoded_frame_through_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pipeline = FramePipeline::new(Arc::new(move |tag, result| {
            let _ = tx.send((tag, result));
        }));
        pipeline.submit(
            &Frame {
                payload: Bytes::from(png(6, 5)),
                sequence_id: 42,
                generation_time_ms: Some(12.0),
            },
            7,
        );
        let (tag, result) = rx.recv().await.unwrap();
        assert_eq!(tag, 7);
        let decoded = result.unwrap();
        assert_eq!(decoded.sequence_id, 42);
        assert_eq!(decoded.dimensions(), (6, 5));
    }
}
