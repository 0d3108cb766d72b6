use pdf_writer::{Content, Filter, Name, Pdf, Rect, Ref, Str};

use crate::error::Error;
use crate::fonts::CaptionFont;
use crate::model::Placement;
use crate::placement::{CAPTION_FONT_SIZE, caption_origin};
use crate::qr::QrImage;

/// Caption printed under every QR code ("version check").
pub const CAPTION: &str = "проверка версии";

const QR_IMAGE_NAME: &[u8] = b"Qr";
const CAPTION_FONT_NAME: &[u8] = b"F1";

/// A transparent single-page PDF the size of one target page, carrying the
/// QR image, its link and the caption.
pub struct OverlaySurface {
    pub width: f32,
    pub height: f32,
    pdf: Vec<u8>,
}

impl OverlaySurface {
    pub(crate) fn new(width: f32, height: f32, pdf: Vec<u8>) -> Self {
        OverlaySurface { width, height, pdf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pdf
    }
}

/// Reject an overlay request whose page size differs from the size the
/// placement was computed for. Overlays are never scaled to fit.
pub fn check_size(placement: &Placement, width: f32, height: f32) -> Result<(), Error> {
    if placement.page.same_size(width, height) {
        Ok(())
    } else {
        Err(Error::PageSizeMismatch {
            expected: (placement.page.width, placement.page.height),
            actual: (width, height),
        })
    }
}

pub fn render(
    qr: &QrImage,
    placement: &Placement,
    url: &str,
    font: &CaptionFont,
    width: f32,
    height: f32,
) -> Result<OverlaySurface, Error> {
    check_size(placement, width, height)?;

    let mut pdf = Pdf::new();
    let mut next_id = 1i32;
    let mut alloc = || {
        let r = Ref::new(next_id);
        next_id += 1;
        r
    };

    let catalog_id = alloc();
    let pages_id = alloc();
    let page_id = alloc();
    let content_id = alloc();
    let font_ref = alloc();
    let image_ref = alloc();
    let annot_ref = alloc();

    font.write(&mut pdf, font_ref, &mut alloc);

    {
        let mut xobj = pdf.image_xobject(image_ref, qr.gray_flate());
        xobj.filter(Filter::FlateDecode);
        xobj.width(qr.width() as i32);
        xobj.height(qr.height() as i32);
        xobj.color_space().device_gray();
        xobj.bits_per_component(8);
        xobj.interpolate(false);
    }

    let rect = placement.qr;
    let mut content = Content::new();
    content.save_state();
    content.transform([rect.width, 0.0, 0.0, rect.height, rect.x, rect.y]);
    content.x_object(Name(QR_IMAGE_NAME));
    content.restore_state();

    let caption_width = font.text_width(CAPTION, CAPTION_FONT_SIZE);
    let (tx, ty) = caption_origin(placement, caption_width, font.ascent(CAPTION_FONT_SIZE));
    content.set_fill_gray(0.0);
    content.begin_text();
    content.set_font(Name(CAPTION_FONT_NAME), CAPTION_FONT_SIZE);
    content.next_line(tx, ty);
    content.show(Str(&font.encode(CAPTION)));
    content.end_text();

    let raw = content.finish();
    let compressed = miniz_oxide::deflate::compress_to_vec_zlib(raw.as_slice(), 6);
    pdf.stream(content_id, &compressed).filter(Filter::FlateDecode);

    // Absolute page coordinates, exactly over the QR image.
    {
        let mut annot = pdf.annotation(annot_ref);
        annot
            .subtype(pdf_writer::types::AnnotationType::Link)
            .rect(rect.to_pdf())
            .border(0.0, 0.0, 0.0, None);
        annot
            .action()
            .action_type(pdf_writer::types::ActionType::Uri)
            .uri(Str(url.as_bytes()));
    }

    pdf.catalog(catalog_id).pages(pages_id);
    pdf.pages(pages_id).kids([page_id]).count(1);
    {
        let mut page = pdf.page(page_id);
        page.media_box(Rect::new(0.0, 0.0, width, height))
            .parent(pages_id)
            .contents(content_id);
        page.annotations([annot_ref]);
        let mut resources = page.resources();
        resources.fonts().pair(Name(CAPTION_FONT_NAME), font_ref);
        resources.x_objects().pair(Name(QR_IMAGE_NAME), image_ref);
    }

    let bytes = pdf.finish();
    log::debug!(
        "Overlay {width:.1}x{height:.1}: QR at ({:.1},{:.1}), caption at ({tx:.1},{ty:.1}), {} bytes",
        rect.x,
        rect.y,
        bytes.len(),
    );

    Ok(OverlaySurface::new(width, height, bytes))
}
