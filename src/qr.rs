use image::{Rgba, RgbaImage};
use qrcode::{Color, EcLevel, QrCode, Version};

use crate::error::Error;

/// Fixed symbol version: 41x41 modules.
pub const QR_VERSION: i16 = 6;
/// Byte-mode capacity of a version 6 symbol at error correction level M.
pub const QR_BYTE_CAPACITY: usize = 106;
/// Edge length of one module in raster pixels.
pub const MODULE_PX: u32 = 10;
/// Quiet zone drawn around the symbol, in modules.
pub const QUIET_ZONE: u32 = 1;

const DARK: Rgba<u8> = Rgba([0, 0, 0, 255]);
const LIGHT: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Encode `url` into a black-on-white raster.
///
/// The version and error correction level are fixed, so every symbol has the
/// same module count. A URL that does not fit is rejected instead of being
/// truncated.
pub fn generate(url: &str) -> Result<RgbaImage, Error> {
    let code = QrCode::with_version(url.as_bytes(), Version::Normal(QR_VERSION), EcLevel::M)
        .map_err(|e| Error::Encoding {
            len: url.len(),
            capacity: QR_BYTE_CAPACITY,
            reason: e.to_string(),
        })?;

    let modules = code.width() as u32;
    let side = (modules + 2 * QUIET_ZONE) * MODULE_PX;
    let mut img = RgbaImage::from_pixel(side, side, LIGHT);

    for (i, color) in code.to_colors().iter().enumerate() {
        if *color != Color::Dark {
            continue;
        }
        let mx = (i as u32) % modules + QUIET_ZONE;
        let my = (i as u32) / modules + QUIET_ZONE;
        for dy in 0..MODULE_PX {
            for dx in 0..MODULE_PX {
                img.put_pixel(mx * MODULE_PX + dx, my * MODULE_PX + dy, DARK);
            }
        }
    }

    log::debug!(
        "QR symbol: {} bytes, {modules}x{modules} modules, {side}x{side} px",
        url.len()
    );
    Ok(img)
}

/// A QR raster cropped to its dark extent, with its PDF image samples
/// encoded once so every overlay can reuse them.
pub struct QrImage {
    pixels: RgbaImage,
    gray_flate: Vec<u8>,
}

impl QrImage {
    fn new(pixels: RgbaImage) -> Self {
        // Composite over white so transparent pixels read as paper.
        let gray: Vec<u8> = pixels
            .pixels()
            .map(|p| {
                let [r, g, b, a] = p.0;
                let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32) / 1000;
                ((luma * a as u32 + 255 * (255 - a as u32)) / 255) as u8
            })
            .collect();
        let gray_flate = miniz_oxide::deflate::compress_to_vec_zlib(&gray, 6);
        QrImage { pixels, gray_flate }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Zlib-compressed 8-bit DeviceGray samples, row-major.
    pub(crate) fn gray_flate(&self) -> &[u8] {
        &self.gray_flate
    }
}

fn is_background(p: &Rgba<u8>) -> bool {
    p.0[3] == 0 || *p == LIGHT
}

/// Crop `raster` to the bounding box of its non-background pixels.
///
/// Background is opaque white or fully transparent. A raster with nothing
/// else in it is an error rather than a zero-sized image.
pub fn trim(raster: &RgbaImage) -> Result<QrImage, Error> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0u32;
    let mut max_y = 0u32;

    for (x, y, p) in raster.enumerate_pixels() {
        if is_background(p) {
            continue;
        }
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    if min_x == u32::MAX {
        return Err(Error::EmptySymbol);
    }

    let (w, h) = (max_x - min_x + 1, max_y - min_y + 1);
    let cropped = image::imageops::crop_imm(raster, min_x, min_y, w, h).to_image();
    log::debug!(
        "Trimmed QR raster {}x{} → {w}x{h} at ({min_x},{min_y})",
        raster.width(),
        raster.height()
    );
    Ok(QrImage::new(cropped))
}
