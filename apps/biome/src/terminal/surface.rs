//! Presents frames as half-block cells: each character cell shows two
//! vertically stacked pixels.

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use image::imageops;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::frame::{DecodedFrame, PresentationSurface};

/// Frame scaled down to the terminal grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub sequence_id: u64,
    pub cols: u16,
    pub rows: u16,
    /// `cols * rows * 2` pixels, row-major, two pixel rows per text row.
    pub pixels: Vec<[u8; 3]>,
}

#[derive(Debug, Default)]
struct Shared {
    viewport: (u16, u16),
    source: Option<(u32, u32)>,
    latest: Option<Picture>,
}

/// Surface half, owned by the frame pipeline.
pub struct TerminalSurface {
    shared: Arc<Mutex<Shared>>,
}

/// Drawing half, owned by the terminal loop.
#[derive(Clone)]
pub struct SurfaceView {
    shared: Arc<Mutex<Shared>>,
}

pub fn terminal_surface(cols: u16, rows: u16) -> (TerminalSurface, SurfaceView) {
    let shared = Arc::new(Mutex::new(Shared {
        viewport: (cols, rows),
        ..Shared::default()
    }));
    (
        TerminalSurface {
            shared: shared.clone(),
        },
        SurfaceView { shared },
    )
}

impl PresentationSurface for TerminalSurface {
    fn resize(&mut self, width: u32, height: u32) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.source = Some((width, height));
        }
    }

    fn blit(&mut self, frame: &DecodedFrame) {
        let Ok(mut shared) = self.shared.lock() else {
            return;
        };
        let (cols, rows) = shared.viewport;
        if cols == 0 || rows == 0 {
            return;
        }
        let scaled = imageops::thumbnail(&frame.image, u32::from(cols), u32::from(rows) * 2);
        let pixels = scaled
            .pixels()
            .map(|pixel| [pixel[0], pixel[1], pixel[2]])
            .collect();
        shared.latest = Some(Picture {
            sequence_id: frame.sequence_id,
            cols,
            rows,
            pixels,
        });
    }
}

impl SurfaceView {
    /// Area available for the picture, in cells.
    pub fn set_viewport(&self, cols: u16, rows: u16) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.viewport = (cols, rows);
        }
    }

    /// Source frame size, once one has been presented.
    pub fn source_size(&self) -> Option<(u32, u32)> {
        self.shared.lock().ok().and_then(|shared| shared.source)
    }

    /// The newest picture not yet drawn.
    pub fn take_picture(&self) -> Option<Picture> {
        self.shared.lock().ok().and_then(|mut shared| shared.latest.take())
    }

    pub fn clear(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.latest = None;
            shared.source = None;
        }
    }
}

/// Queues `picture` at the top-left corner of `out`.
pub fn draw_picture<W: Write>(out: &mut W, picture: &Picture) -> io::Result<()> {
    let cols = usize::from(picture.cols);
    for row in 0..picture.rows {
        queue!(out, MoveTo(0, row))?;
        let top_start = usize::from(row) * 2 * cols;
        for col in 0..cols {
            let top = picture.pixels.get(top_start + col);
            let bottom = picture.pixels.get(top_start + cols + col);
            let (Some(top), Some(bottom)) = (top, bottom) else {
                break;
            };
            queue!(
                out,
                SetForegroundColor(rgb(*top)),
                SetBackgroundColor(rgb(*bottom)),
                Print('▀')
            )?;
        }
    }
    queue!(out, ResetColor)
}

fn rgb([r, g, b]: [u8; 3]) -> Color {
    Color::Rgb { r, g, b }
}
