use std::path::{Path, PathBuf};

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};

pub const URL: &str = "https://docs.example.com/plans/7f3a/revision/12";

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu-sans-fonts/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation-sans/LiberationSans-Regular.ttf",
    "/usr/share/fonts/truetype/freefont/FreeSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// A TrueType font with Cyrillic glyphs for the caption. Set
/// QRSTAMP_TEST_FONT to pick one explicitly.
pub fn test_font() -> Option<String> {
    if let Ok(font) = std::env::var("QRSTAMP_TEST_FONT") {
        return Some(font);
    }
    FONT_CANDIDATES
        .iter()
        .find(|p| Path::new(p).is_file())
        .map(|p| p.to_string())
}

/// `test_font()` or print why the test is skipped.
pub fn font_or_skip(test: &str) -> Option<String> {
    let font = test_font();
    if font.is_none() {
        println!("{test}: no caption font found (set QRSTAMP_TEST_FONT), skipping");
    }
    font
}

/// A document with one page per `sizes` entry. Page `n` shows the text
/// `Page n` and carries its own media box.
pub fn build_pdf(sizes: &[(f32, f32)]) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids = Vec::new();
    for (i, &(w, h)) in sizes.iter().enumerate() {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![100.into(), 100.into()]),
                Operation::new("Tj", vec![Object::string_literal(format!("Page {}", i + 1))]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id =
            doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::from(w), Object::from(h)],
        });
        kids.push(Object::Reference(page_id));
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}

pub fn write_pdf(dir: &Path, name: &str, sizes: &[(f32, f32)]) -> PathBuf {
    let path = dir.join(name);
    build_pdf(sizes).save(&path).unwrap();
    path
}

pub fn page_ids(doc: &Document) -> Vec<ObjectId> {
    doc.get_pages().into_values().collect()
}

/// Media box of a page as (x0, y0, x1, y1).
pub fn media_box(doc: &Document, page_id: ObjectId) -> [f32; 4] {
    let page = doc.get_dictionary(page_id).unwrap();
    let mut obj = page.get(b"MediaBox");
    if obj.is_err() {
        let parent = page.get(b"Parent").unwrap().as_reference().unwrap();
        obj = doc.get_dictionary(parent).unwrap().get(b"MediaBox");
    }
    let nums: Vec<f32> = obj
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o.as_float().unwrap())
        .collect();
    [nums[0], nums[1], nums[2], nums[3]]
}

pub fn annotations(doc: &Document, page_id: ObjectId) -> Vec<Dictionary> {
    let page = doc.get_dictionary(page_id).unwrap();
    let Ok(annots) = page.get(b"Annots") else {
        return Vec::new();
    };
    let annots = match annots {
        Object::Reference(id) => doc.get_object(*id).unwrap(),
        direct => direct,
    };
    annots
        .as_array()
        .unwrap()
        .iter()
        .map(|o| match o {
            Object::Reference(id) => doc.get_dictionary(*id).unwrap().clone(),
            direct => direct.as_dict().unwrap().clone(),
        })
        .collect()
}

pub fn is_subtype(dict: &Dictionary, subtype: &[u8]) -> bool {
    matches!(dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == subtype)
}

/// Link annotations and the URI each one opens.
pub fn link_uris(doc: &Document, page_id: ObjectId) -> Vec<(Dictionary, String)> {
    annotations(doc, page_id)
        .into_iter()
        .filter(|a| is_subtype(a, b"Link"))
        .map(|a| {
            let action = match a.get(b"A").unwrap() {
                Object::Reference(id) => doc.get_dictionary(*id).unwrap().clone(),
                direct => direct.as_dict().unwrap().clone(),
            };
            let uri = match action.get(b"URI").unwrap() {
                Object::String(bytes, _) => String::from_utf8(bytes.clone()).unwrap(),
                other => panic!("URI is not a string: {other:?}"),
            };
            (a, uri)
        })
        .collect()
}

pub fn rect(dict: &Dictionary) -> [f32; 4] {
    let nums: Vec<f32> = dict
        .get(b"Rect")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o.as_float().unwrap())
        .collect();
    [nums[0], nums[1], nums[2], nums[3]]
}

pub fn assert_close(actual: [f32; 4], expected: [f32; 4]) {
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 0.01, "{actual:?} != {expected:?}");
    }
}
