use crate::model::{PageGeometry, Placement, Rect};

const INCH: f32 = 72.0;

/// Edge length of the QR image.
pub const QR_SIZE: f32 = 0.7 * INCH;
/// Distance from the left page edge to the QR image.
pub const MARGIN_X: f32 = 6.0;
/// Distance from the top page edge to the QR image.
pub const MARGIN_TOP: f32 = 25.0;
/// Space between the bottom of the QR image and the top of the caption.
pub const CAPTION_GAP: f32 = 0.05 * INCH;
pub const CAPTION_FONT_SIZE: f32 = 7.0;

/// Smallest page on which the QR image and caption stay inside the page.
pub const MIN_PAGE_WIDTH: f32 = MARGIN_X + QR_SIZE;
pub const MIN_PAGE_HEIGHT: f32 = MARGIN_TOP + QR_SIZE + CAPTION_GAP + CAPTION_FONT_SIZE;

/// Page format classes that may get their own QR offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageFormat {
    A3Landscape,
    A4Portrait,
    A2Landscape,
    Other,
}

impl PageFormat {
    // These dimensions are centimetres while pages are measured in points, so
    // no real page matches and every page classifies as `Other`.
    pub fn classify(width: f32, height: f32) -> PageFormat {
        const KNOWN: [(f32, f32, PageFormat); 3] = [
            (42.02, 29.71, PageFormat::A3Landscape),
            (21.01, 29.71, PageFormat::A4Portrait),
            (59.41, 42.02, PageFormat::A2Landscape),
        ];
        KNOWN
            .iter()
            .find(|(w, h, _)| *w == width && *h == height)
            .map(|&(_, _, format)| format)
            .unwrap_or(PageFormat::Other)
    }

    /// (left margin, top margin) for this format.
    pub fn offset(self) -> (f32, f32) {
        match self {
            PageFormat::A3Landscape | PageFormat::A4Portrait | PageFormat::A2Landscape => {
                (MARGIN_X, MARGIN_TOP)
            }
            PageFormat::Other => (MARGIN_X, MARGIN_TOP),
        }
    }
}

/// QR placement for a page: anchored to the upper-left corner.
pub fn place(page: PageGeometry) -> Placement {
    let (margin_x, margin_top) = PageFormat::classify(page.width, page.height).offset();
    Placement {
        page,
        qr: Rect {
            x: margin_x,
            y: page.height - QR_SIZE - margin_top,
            width: QR_SIZE,
            height: QR_SIZE,
        },
    }
}

/// Caption baseline origin: centred under the QR image, one gap plus the
/// font ascent below its bottom edge. A caption wider than the QR image
/// overhangs on both sides.
pub fn caption_origin(placement: &Placement, caption_width: f32, ascent: f32) -> (f32, f32) {
    let qr = &placement.qr;
    let x = qr.x + (qr.width - caption_width) / 2.0;
    let y = qr.y - CAPTION_GAP - ascent;
    (x, y)
}
