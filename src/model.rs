/// Media box of one page, in PDF points.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageGeometry {
    pub x0: f32,
    pub y0: f32,
    pub width: f32,
    pub height: f32,
}

impl PageGeometry {
    pub fn new(width: f32, height: f32) -> Self {
        PageGeometry {
            x0: 0.0,
            y0: 0.0,
            width,
            height,
        }
    }

    /// Same size within a hundredth of a point.
    pub fn same_size(&self, width: f32, height: f32) -> bool {
        (self.width - width).abs() < 0.01 && (self.height - height).abs() < 0.01
    }
}

/// Axis-aligned rectangle with its origin at the bottom-left corner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn top(&self) -> f32 {
        self.y + self.height
    }

    pub(crate) fn to_pdf(self) -> pdf_writer::Rect {
        pdf_writer::Rect::new(self.x, self.y, self.right(), self.top())
    }
}

/// Where the QR image goes on one page. The link region is the same rectangle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub page: PageGeometry,
    pub qr: Rect,
}

impl Placement {
    /// True when the QR rectangle lies entirely inside the page.
    pub fn fits(&self) -> bool {
        self.qr.x >= 0.0
            && self.qr.y >= 0.0
            && self.qr.right() <= self.page.width
            && self.qr.top() <= self.page.height
    }
}
