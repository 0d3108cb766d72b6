mod common;

use lopdf::{Document, Object, dictionary};
use qr_stamp_pdf::placement::{MARGIN_TOP, MARGIN_X, QR_SIZE};
use qr_stamp_pdf::{Error, FontRegistry, StampOptions, stamp_bytes, stamp_pdf};

const LETTER: (f32, f32) = (612.0, 792.0);
const A4: (f32, f32) = (595.28, 841.89);
const A3_LANDSCAPE: (f32, f32) = (1190.55, 841.89);

fn options(font: String) -> StampOptions {
    StampOptions {
        font,
        ..StampOptions::default()
    }
}

fn expected_qr_rect(height: f32) -> [f32; 4] {
    let y = height - MARGIN_TOP - QR_SIZE;
    [MARGIN_X, y, MARGIN_X + QR_SIZE, y + QR_SIZE]
}

#[test]
fn letter_page_gets_link_and_form() {
    let _ = env_logger::try_init();
    let Some(font) = common::font_or_skip("letter_page_gets_link_and_form") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let input = common::write_pdf(dir.path(), "plan.pdf", &[LETTER]);

    let report = stamp_pdf(&input, common::URL, &options(font)).unwrap();
    assert_eq!(report.output, dir.path().join("plan_with_qr.pdf"));
    assert_eq!(report.pages, 1);

    let doc = Document::load(&report.output).unwrap();
    let pages = common::page_ids(&doc);
    assert_eq!(pages.len(), 1);
    assert_eq!(common::media_box(&doc, pages[0]), [0.0, 0.0, 612.0, 792.0]);

    let links = common::link_uris(&doc, pages[0]);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].1, common::URL);
    common::assert_close(common::rect(&links[0].0), expected_qr_rect(792.0));

    let page = doc.get_dictionary(pages[0]).unwrap();
    let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
    let xobjects = resources.get(b"XObject").unwrap().as_dict().unwrap();
    let form_id = xobjects.get(b"QrStamp").unwrap().as_reference().unwrap();
    let Object::Stream(form) = doc.get_object(form_id).unwrap() else {
        panic!("overlay is not a stream");
    };
    assert!(common::is_subtype(&form.dict, b"Form"));
    // Inherited font resources of the original content survive.
    assert!(resources.get(b"Font").is_ok());
}

#[test]
fn original_content_is_kept() {
    let Some(font) = common::font_or_skip("original_content_is_kept") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let input = common::write_pdf(dir.path(), "doc.pdf", &[LETTER, A4]);

    let report = stamp_pdf(&input, common::URL, &options(font)).unwrap();
    let doc = Document::load(&report.output).unwrap();
    for (i, page_id) in common::page_ids(&doc).into_iter().enumerate() {
        let content = doc.get_page_content(page_id).unwrap();
        let text = String::from_utf8_lossy(&content);
        assert!(text.contains(&format!("(Page {})", i + 1)), "page {}: {text}", i + 1);
        let original = text.find("Page").unwrap();
        let draw = text.find("/QrStamp Do").unwrap();
        assert!(original < draw, "overlay drawn before original content");
    }
}

#[test]
fn every_page_is_stamped_at_its_own_size() {
    let Some(font) = common::font_or_skip("every_page_is_stamped_at_its_own_size") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let sizes = [LETTER, A4, A3_LANDSCAPE, (LETTER.1, LETTER.0), A4];
    let input = common::write_pdf(dir.path(), "mixed.pdf", &sizes);

    let report = stamp_pdf(&input, common::URL, &options(font)).unwrap();
    assert_eq!(report.pages, sizes.len());

    let doc = Document::load(&report.output).unwrap();
    let pages = common::page_ids(&doc);
    assert_eq!(pages.len(), sizes.len());
    for (page_id, (w, h)) in pages.into_iter().zip(sizes) {
        common::assert_close(common::media_box(&doc, page_id), [0.0, 0.0, w, h]);
        let links = common::link_uris(&doc, page_id);
        assert_eq!(links.len(), 1, "{w}x{h}");
        common::assert_close(common::rect(&links[0].0), expected_qr_rect(h));
    }
}

#[test]
fn output_is_deterministic_across_runs() {
    let Some(font) = common::font_or_skip("output_is_deterministic_across_runs") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let sizes: Vec<(f32, f32)> = (0..50).map(|i| if i % 3 == 0 { A4 } else { LETTER }).collect();
    let input = common::write_pdf(dir.path(), "long.pdf", &sizes);

    let first = dir.path().join("first");
    let second = dir.path().join("second");
    let run = |out: &std::path::Path, jobs| {
        let options = StampOptions {
            out_dir: Some(out.to_path_buf()),
            font: font.clone(),
            jobs: Some(jobs),
        };
        stamp_pdf(&input, common::URL, &options).unwrap()
    };
    let a = run(&first, 4);
    let b = run(&second, 1);
    assert_eq!(a.pages, 50);
    assert_eq!(a.output, first.join("long.pdf"));
    assert_eq!(b.output, second.join("long.pdf"));
    assert_eq!(std::fs::read(&a.output).unwrap(), std::fs::read(&b.output).unwrap());
}

#[test]
fn existing_annotations_are_kept() {
    let Some(font) = common::font_or_skip("existing_annotations_are_kept") else {
        return;
    };
    let mut doc = common::build_pdf(&[LETTER]);
    let page_id = common::page_ids(&doc)[0];
    let note = doc.add_object(lopdf::dictionary! {
        "Type" => "Annot",
        "Subtype" => "Text",
        "Rect" => vec![Object::Integer(300), Object::Integer(300), Object::Integer(320), Object::Integer(320)],
        "Contents" => Object::string_literal("reviewed"),
    });
    doc.get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .unwrap()
        .set("Annots", vec![Object::Reference(note)]);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();

    let font = FontRegistry::new().register(&font).unwrap();
    let stamped = stamp_bytes(&bytes, common::URL, font, Some(2)).unwrap();

    let doc = Document::load_mem(&stamped).unwrap();
    let annots = common::annotations(&doc, common::page_ids(&doc)[0]);
    assert_eq!(annots.len(), 2);
    assert!(common::is_subtype(&annots[0], b"Text"));
    assert!(common::is_subtype(&annots[1], b"Link"));
}

#[test]
fn shifted_media_box_moves_the_link() {
    let Some(font) = common::font_or_skip("shifted_media_box_moves_the_link") else {
        return;
    };
    let mut doc = common::build_pdf(&[LETTER]);
    let page_id = common::page_ids(&doc)[0];
    doc.get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .unwrap()
        .set(
            "MediaBox",
            vec![Object::Integer(100), Object::Integer(50), Object::Integer(712), Object::Integer(842)],
        );
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();

    let font = FontRegistry::new().register(&font).unwrap();
    let stamped = stamp_bytes(&bytes, common::URL, font, None).unwrap();

    let doc = Document::load_mem(&stamped).unwrap();
    let page_id = common::page_ids(&doc)[0];
    assert_eq!(common::media_box(&doc, page_id), [100.0, 50.0, 712.0, 842.0]);
    let links = common::link_uris(&doc, page_id);
    let [x0, y0, x1, y1] = expected_qr_rect(792.0);
    common::assert_close(common::rect(&links[0].0), [x0 + 100.0, y0 + 50.0, x1 + 100.0, y1 + 50.0]);
}

#[test]
fn input_file_is_left_untouched() {
    let Some(font) = common::font_or_skip("input_file_is_left_untouched") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let input = common::write_pdf(dir.path(), "plan.pdf", &[A4]);
    let before = std::fs::read(&input).unwrap();

    let options = StampOptions {
        out_dir: Some(dir.path().to_path_buf()),
        font,
        jobs: None,
    };
    let report = stamp_pdf(&input, common::URL, &options).unwrap();
    assert_eq!(report.output, dir.path().join("plan_with_qr.pdf"));
    assert_eq!(std::fs::read(&input).unwrap(), before);

    // Only the input and the stamped copy remain; no partial files.
    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, ["plan.pdf", "plan_with_qr.pdf"]);
}

#[test]
fn missing_input_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("absent.pdf");
    let err = stamp_pdf(&input, common::URL, &StampOptions::default()).unwrap_err();
    assert!(matches!(err, Error::InputNotFound(_)), "{err}");
    assert!(!dir.path().join("absent_with_qr.pdf").exists());
}

#[test]
fn unknown_font_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = common::write_pdf(dir.path(), "plan.pdf", &[LETTER]);
    let err = stamp_pdf(&input, common::URL, &options("/no/such/dir/GOST_A.TTF".into())).unwrap_err();
    assert!(matches!(err, Error::FontLoad { .. }), "{err}");
    assert!(!dir.path().join("plan_with_qr.pdf").exists());
}

#[test]
fn overlong_url_writes_nothing() {
    let Some(font) = common::font_or_skip("overlong_url_writes_nothing") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let input = common::write_pdf(dir.path(), "plan.pdf", &[LETTER]);
    let url = format!("https://example.com/{}", "a".repeat(200));
    let err = stamp_pdf(&input, &url, &options(font)).unwrap_err();
    assert!(matches!(err, Error::Encoding { .. }), "{err}");
    assert!(!dir.path().join("plan_with_qr.pdf").exists());
}

#[test]
fn document_without_pages_is_rejected() {
    let mut doc = common::build_pdf(&[]);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    let err = qr_stamp_pdf::compose::load_document_mem(&bytes).unwrap_err();
    assert!(matches!(err, Error::Merge { page: 0, .. }), "{err}");
}

#[test]
fn unparsable_input_is_merge_error() {
    let Some(font) = common::font_or_skip("unparsable_input_is_merge_error") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.pdf");
    std::fs::write(&input, b"this is not a pdf").unwrap();
    let err = stamp_pdf(&input, common::URL, &options(font)).unwrap_err();
    assert!(matches!(err, Error::Merge { .. }), "{err}");
    assert!(!dir.path().join("broken_with_qr.pdf").exists());
}

#[test]
fn broken_page_aborts_the_whole_document() {
    let Some(font) = common::font_or_skip("broken_page_aborts_the_whole_document") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let mut doc = common::build_pdf(&[LETTER; 5]);
    let third = common::page_ids(&doc)[2];
    doc.get_object_mut(third)
        .and_then(Object::as_dict_mut)
        .unwrap()
        .set("Contents", Object::Reference((9999, 0)));
    let input = dir.path().join("bad.pdf");
    doc.save(&input).unwrap();

    let err = stamp_pdf(&input, common::URL, &options(font)).unwrap_err();
    assert!(matches!(err, Error::Merge { page: 3, .. }), "{err}");

    // Neither the output nor a partial temporary file is left behind.
    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["bad.pdf"]);
}

#[test]
fn font_and_image_are_embedded_once() {
    let Some(font) = common::font_or_skip("font_and_image_are_embedded_once") else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let input = common::write_pdf(dir.path(), "long.pdf", &[A4; 12]);

    let report = stamp_pdf(&input, common::URL, &options(font)).unwrap();
    let doc = Document::load(&report.output).unwrap();

    let mut images = 0;
    let mut composite_fonts = 0;
    let mut forms = 0;
    for obj in doc.objects.values() {
        match obj {
            Object::Stream(s) if common::is_subtype(&s.dict, b"Image") => images += 1,
            Object::Stream(s) if common::is_subtype(&s.dict, b"Form") => forms += 1,
            Object::Dictionary(d) if common::is_subtype(d, b"Type0") => composite_fonts += 1,
            _ => {}
        }
    }
    assert_eq!(images, 1);
    assert_eq!(composite_fonts, 1);
    assert_eq!(forms, 12);

    let input_size = std::fs::metadata(&input).unwrap().len();
    let output_size = std::fs::metadata(&report.output).unwrap().len();
    println!("12 pages: input {input_size} bytes, stamped {output_size} bytes");
}
