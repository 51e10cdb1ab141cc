use crate::shared::config::{RecognitionConfig, RectOffsets};
use crate::shared::constants::IR_ZOOM_RATIO;
use crate::shared::face_rect::FaceRect;

/// Maps engine (camera-space) rectangles into display and infra-red space.
///
/// Display space is the canvas the frame is rendered into; the IR preview
/// is drawn at `IR_ZOOM_RATIO` of the canvas.
#[derive(Clone, Debug, PartialEq)]
pub struct RectTransformer {
    preview_width: u32,
    preview_height: u32,
    canvas_width: u32,
    canvas_height: u32,
    rgb_mirror: bool,
    ir_mirror: bool,
    offsets: RectOffsets,
}

impl RectTransformer {
    pub fn new(
        preview: (u32, u32),
        canvas: (u32, u32),
        rgb_mirror: bool,
        ir_mirror: bool,
        offsets: RectOffsets,
    ) -> Self {
        Self {
            preview_width: preview.0.max(1),
            preview_height: preview.1.max(1),
            canvas_width: canvas.0,
            canvas_height: canvas.1,
            rgb_mirror,
            ir_mirror,
            offsets,
        }
    }

    /// Transformer for frames of `preview` size under `config`.
    pub fn for_frame(config: &RecognitionConfig, preview: (u32, u32)) -> Self {
        Self::new(
            preview,
            config.display_size.unwrap_or(preview),
            config.rgb_mirror,
            config.ir_mirror,
            config.rect_offsets,
        )
    }

    /// Camera rect to display rect: scale, optionally mirror, then offset.
    pub fn to_display(&self, raw: &FaceRect) -> FaceRect {
        let sx = self.canvas_width as f64 / self.preview_width as f64;
        let sy = self.canvas_height as f64 / self.preview_height as f64;

        let mut left = (raw.x as f64 * sx).round() as i32;
        let mut right = (raw.right() as f64 * sx).round() as i32;
        let top = (raw.y as f64 * sy).round() as i32;
        let bottom = (raw.bottom() as f64 * sy).round() as i32;

        if self.rgb_mirror {
            let w = self.canvas_width as i32;
            (left, right) = (w - right, w - left);
        }

        FaceRect::from_edges(
            left + self.offsets.rgb_x,
            top + self.offsets.rgb_y,
            right + self.offsets.rgb_x,
            bottom + self.offsets.rgb_y,
        )
    }

    /// Display rect to the scaled-down IR preview.
    pub fn to_ir(&self, display: &FaceRect) -> FaceRect {
        let zoom = IR_ZOOM_RATIO as f64;
        let mut left = (display.x as f64 * zoom).round() as i32;
        let mut right = (display.right() as f64 * zoom).round() as i32;
        let top = (display.y as f64 * zoom).round() as i32;
        let bottom = (display.bottom() as f64 * zoom).round() as i32;

        if self.ir_mirror {
            let w = (self.canvas_width as f64 * zoom).round() as i32;
            (left, right) = (w - right, w - left);
        }

        FaceRect::from_edges(
            left + self.offsets.ir_x,
            top + self.offsets.ir_y,
            right + self.offsets.ir_x,
            bottom + self.offsets.ir_y,
        )
    }

    /// Region a face must lie inside to be recognised.
    ///
    /// With area limiting on, a centred square whose side is `ratio` of the
    /// shorter canvas side; otherwise the whole canvas.
    pub fn recognition_area(&self, limit: bool, ratio: f32) -> FaceRect {
        let (w, h) = (self.canvas_width as i32, self.canvas_height as i32);
        if !limit {
            return FaceRect::new(0, 0, w, h);
        }
        let side = (w.min(h) as f64 * ratio as f64).round() as i32;
        FaceRect::new((w - side) / 2, (h - side) / 2, side, side)
    }
}
