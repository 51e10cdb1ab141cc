/// Pixel layout of a camera buffer.
///
/// Cameras usually deliver NV21 (a full-resolution luma plane followed by an
/// interleaved, half-resolution VU plane); still images arrive packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Nv21,
    Rgb24,
    Bgr24,
}

impl PixelFormat {
    /// Number of bytes a `width` x `height` image occupies in this layout.
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        let pixels = (width as usize) * (height as usize);
        match self {
            PixelFormat::Nv21 => pixels + pixels / 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => pixels * 3,
        }
    }
}

/// A single camera frame as delivered by the frame source.
///
/// The pipeline never decodes pixels itself; the buffer is handed to the
/// engine untouched and shared with worker stages behind an `Arc`.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    index: usize,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, index: usize) -> Self {
        debug_assert_eq!(
            data.len(),
            format.buffer_len(width, height),
            "data length must match width, height and pixel format"
        );
        Self {
            data,
            width,
            height,
            format,
            index,
        }
    }

    /// NV21 frame filled with mid-grey, handy for engines that ignore pixels.
    pub fn blank_nv21(width: u32, height: u32, index: usize) -> Self {
        let len = PixelFormat::Nv21.buffer_len(width, height);
        Self::new(vec![128; len], width, height, PixelFormat::Nv21, index)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Luma plane of an NV21 frame; `None` for packed formats.
    pub fn luma(&self) -> Option<&[u8]> {
        match self.format {
            PixelFormat::Nv21 => {
                let pixels = (self.width as usize) * (self.height as usize);
                Some(&self.data[..pixels])
            }
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => None,
        }
    }
}
