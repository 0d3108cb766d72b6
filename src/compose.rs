//! Merging overlays into an existing document.
//!
//! Each overlay page becomes a Form XObject that the target page draws after
//! its original content. The original content streams are referenced
//! unchanged, wrapped in `q`/`Q` so none of their graphics state leaks into
//! the overlay.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use lopdf::{Dictionary, Document, Object, ObjectId, Stream};

use crate::error::Error;
use crate::model::PageGeometry;
use crate::overlay::OverlaySurface;

/// Upper bound on `/Parent` hops when looking up inherited page attributes.
const MAX_TREE_DEPTH: usize = 64;

const FORM_NAME_PREFIX: &str = "QrStamp";

/// An overlay page converted to a Form XObject, still numbered in the
/// overlay's own object space.
pub struct OverlayForm {
    width: f32,
    height: f32,
    objects: BTreeMap<ObjectId, Object>,
    form_id: ObjectId,
    annots: Vec<ObjectId>,
    shared: BTreeSet<ObjectId>,
    max_id: u32,
}

/// Overlay objects every form of a run has in common (the caption font and
/// the QR image), mapped to where they were first imported into the
/// document. Only valid for forms rendered with the same font and symbol.
#[derive(Default)]
pub struct SharedObjects {
    imported: BTreeMap<ObjectId, ObjectId>,
}

impl SharedObjects {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OverlayForm {
    /// Parse an overlay surface and turn its single page into a form.
    pub fn from_surface(page: u32, surface: &OverlaySurface) -> Result<Self, Error> {
        let mut doc = Document::load_mem(surface.as_bytes())
            .map_err(|e| Error::merge(page, format!("overlay is unreadable: {e}")))?;

        let pages = doc.get_pages();
        let overlay_page_id = match pages.values().collect::<Vec<_>>().as_slice() {
            [id] => **id,
            other => {
                return Err(Error::merge(
                    page,
                    format!("overlay has {} pages, expected 1", other.len()),
                ));
            }
        };

        let bad = |what: &str| Error::merge(page, format!("overlay {what}"));

        let page_dict = doc
            .get_dictionary(overlay_page_id)
            .map_err(|_| bad("page is not a dictionary"))?;
        let content_id = page_dict
            .get(b"Contents")
            .and_then(Object::as_reference)
            .map_err(|_| bad("has no content stream"))?;
        let resources = match page_dict.get(b"Resources") {
            Ok(obj) => resolve(&doc, obj)
                .and_then(|o| o.as_dict().ok())
                .cloned()
                .ok_or_else(|| bad("resources are malformed"))?,
            Err(_) => Dictionary::new(),
        };
        let annots: Vec<ObjectId> = match page_dict.get(b"Annots") {
            Ok(obj) => resolve(&doc, obj)
                .and_then(|o| o.as_array().ok())
                .ok_or_else(|| bad("annotations are malformed"))?
                .iter()
                .filter_map(|o| o.as_reference().ok())
                .collect(),
            Err(_) => Vec::new(),
        };

        let catalog_id = doc
            .trailer
            .get(b"Root")
            .and_then(Object::as_reference)
            .map_err(|_| bad("has no catalog"))?;
        let pages_id = doc
            .get_dictionary(catalog_id)
            .and_then(|c| c.get(b"Pages"))
            .and_then(Object::as_reference)
            .map_err(|_| bad("has no page tree"))?;

        let max_id = doc.max_id;
        let mut objects = std::mem::take(&mut doc.objects);
        objects.remove(&catalog_id);
        objects.remove(&pages_id);
        objects.remove(&overlay_page_id);
        let shared = reachable(&objects, &Object::Dictionary(resources.clone()));

        let Some(Object::Stream(stream)) = objects.get_mut(&content_id) else {
            return Err(bad("content is not a stream"));
        };
        stream.dict.set("Type", Object::Name(b"XObject".to_vec()));
        stream.dict.set("Subtype", Object::Name(b"Form".to_vec()));
        stream.dict.set(
            "BBox",
            Object::Array(vec![real(0.0), real(0.0), real(surface.width), real(surface.height)]),
        );
        stream.dict.set("Resources", Object::Dictionary(resources));

        for id in &annots {
            if let Some(Object::Dictionary(annot)) = objects.get_mut(id) {
                annot.remove(b"P");
            }
        }

        Ok(OverlayForm {
            width: surface.width,
            height: surface.height,
            objects,
            form_id: content_id,
            annots,
            shared,
            max_id,
        })
    }
}

fn real(v: f32) -> Object {
    Object::Real(v.into())
}

fn as_number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn collect_refs(obj: &Object, out: &mut Vec<ObjectId>) {
    match obj {
        Object::Reference(id) => out.push(*id),
        Object::Array(items) => items.iter().for_each(|o| collect_refs(o, out)),
        Object::Dictionary(dict) => dict.iter().for_each(|(_, o)| collect_refs(o, out)),
        Object::Stream(stream) => stream.dict.iter().for_each(|(_, o)| collect_refs(o, out)),
        _ => {}
    }
}

/// Every object id reachable from `root` through `objects`.
fn reachable(objects: &BTreeMap<ObjectId, Object>, root: &Object) -> BTreeSet<ObjectId> {
    let mut seen = BTreeSet::new();
    let mut stack = Vec::new();
    collect_refs(root, &mut stack);
    while let Some(id) = stack.pop() {
        if seen.insert(id)
            && let Some(obj) = objects.get(&id)
        {
            collect_refs(obj, &mut stack);
        }
    }
    seen
}

/// Follow references until a direct object is reached.
fn resolve<'a>(doc: &'a Document, mut obj: &'a Object) -> Option<&'a Object> {
    for _ in 0..MAX_TREE_DEPTH {
        match obj {
            Object::Reference(id) => obj = doc.get_object(*id).ok()?,
            direct => return Some(direct),
        }
    }
    None
}

/// A page attribute, looked up through the `/Parent` chain when the page
/// itself does not carry it.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Option<&'a Object> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..MAX_TREE_DEPTH {
        if let Ok(value) = node.get(key) {
            return resolve(doc, value);
        }
        let parent = node.get(b"Parent").and_then(Object::as_reference).ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

/// Load the source document. Encrypted documents are refused since their
/// content could not be written back.
pub fn load_document(path: &Path) -> Result<Document, Error> {
    let doc = Document::load(path)
        .map_err(|e| Error::merge(0, format!("cannot read {}: {e}", path.display())))?;
    check_document(doc)
}

pub fn load_document_mem(bytes: &[u8]) -> Result<Document, Error> {
    let doc = Document::load_mem(bytes)
        .map_err(|e| Error::merge(0, format!("cannot parse document: {e}")))?;
    check_document(doc)
}

fn check_document(doc: Document) -> Result<Document, Error> {
    if doc.is_encrypted() {
        return Err(Error::merge(0, "encrypted documents are not supported"));
    }
    if doc.get_pages().is_empty() {
        return Err(Error::merge(0, "document has no pages"));
    }
    Ok(doc)
}

/// Effective media box of a page.
pub fn page_geometry(doc: &Document, page: u32, page_id: ObjectId) -> Result<PageGeometry, Error> {
    let media_box = inherited(doc, page_id, b"MediaBox")
        .ok_or_else(|| Error::merge(page, "page has no media box"))?;
    let nums: Vec<f32> = media_box
        .as_array()
        .map_err(|_| Error::merge(page, "media box is not an array"))?
        .iter()
        .filter_map(|o| resolve(doc, o).and_then(as_number))
        .collect();
    let [a, b, c, d] = nums[..] else {
        return Err(Error::merge(page, "media box needs four numbers"));
    };
    let geometry = PageGeometry {
        x0: a.min(c),
        y0: b.min(d),
        width: (c - a).abs(),
        height: (d - b).abs(),
    };
    if geometry.width <= 0.0 || geometry.height <= 0.0 {
        return Err(Error::merge(page, "media box is empty"));
    }
    Ok(geometry)
}

/// Rewrite every reference in `obj` into the destination's id space.
fn renumber(obj: Object, map: &impl Fn(ObjectId) -> ObjectId) -> Object {
    match obj {
        Object::Reference(id) => Object::Reference(map(id)),
        Object::Array(arr) => Object::Array(arr.into_iter().map(|o| renumber(o, map)).collect()),
        Object::Dictionary(dict) => Object::Dictionary(renumber_dict(dict, map)),
        Object::Stream(mut stream) => {
            stream.dict = renumber_dict(stream.dict, map);
            Object::Stream(stream)
        }
        other => other,
    }
}

fn renumber_dict(dict: Dictionary, map: &impl Fn(ObjectId) -> ObjectId) -> Dictionary {
    let mut out = Dictionary::new();
    for (key, value) in dict.into_iter() {
        out.set(key, renumber(value, map));
    }
    out
}

/// The page's content streams as references, in drawing order.
fn content_refs(doc: &Document, page: u32, page_id: ObjectId) -> Result<Vec<Object>, Error> {
    let page_dict = doc
        .get_dictionary(page_id)
        .map_err(|_| Error::merge(page, "page is not a dictionary"))?;
    let Ok(contents) = page_dict.get(b"Contents") else {
        return Ok(Vec::new());
    };

    let refs: Vec<ObjectId> = match contents {
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Stream(_)) => vec![*id],
            Ok(Object::Array(items)) => items
                .iter()
                .map(|o| o.as_reference().map_err(|_| Error::merge(page, "content entry is not a reference")))
                .collect::<Result<_, _>>()?,
            Ok(_) => return Err(Error::merge(page, "contents are neither a stream nor an array")),
            Err(e) => return Err(Error::merge(page, format!("content stream {id:?} is missing: {e}"))),
        },
        Object::Array(items) => items
            .iter()
            .map(|o| o.as_reference().map_err(|_| Error::merge(page, "content entry is not a reference")))
            .collect::<Result<_, _>>()?,
        _ => return Err(Error::merge(page, "contents are neither a stream nor an array")),
    };

    for id in &refs {
        match doc.get_object(*id) {
            Ok(Object::Stream(_)) => {}
            Ok(_) => return Err(Error::merge(page, format!("content {id:?} is not a stream"))),
            Err(e) => return Err(Error::merge(page, format!("content stream {id:?} is missing: {e}"))),
        }
    }
    Ok(refs.into_iter().map(Object::Reference).collect())
}

/// A copy of the page's effective resources with the `/XObject` entry
/// resolved to a direct dictionary.
fn page_resources(doc: &Document, page: u32, page_id: ObjectId) -> Result<(Dictionary, Dictionary), Error> {
    let resources = match inherited(doc, page_id, b"Resources") {
        Some(obj) => obj
            .as_dict()
            .map_err(|_| Error::merge(page, "resources are not a dictionary"))?
            .clone(),
        None => Dictionary::new(),
    };
    let xobjects = match resources.get(b"XObject") {
        Ok(obj) => resolve(doc, obj)
            .and_then(|o| o.as_dict().ok())
            .cloned()
            .ok_or_else(|| Error::merge(page, "XObject resources are not a dictionary"))?,
        Err(_) => Dictionary::new(),
    };
    Ok((resources, xobjects))
}

fn page_annots(doc: &Document, page: u32, page_id: ObjectId) -> Result<Vec<Object>, Error> {
    let page_dict = doc
        .get_dictionary(page_id)
        .map_err(|_| Error::merge(page, "page is not a dictionary"))?;
    match page_dict.get(b"Annots") {
        Ok(obj) => resolve(doc, obj)
            .and_then(|o| o.as_array().ok())
            .cloned()
            .ok_or_else(|| Error::merge(page, "annotations are not an array")),
        Err(_) => Ok(Vec::new()),
    }
}

fn unused_name(xobjects: &Dictionary) -> String {
    let mut name = FORM_NAME_PREFIX.to_string();
    let mut n = 1;
    while xobjects.has(name.as_bytes()) {
        name = format!("{FORM_NAME_PREFIX}{n}");
        n += 1;
    }
    name
}

fn shift_rect(annot: &mut Dictionary, dx: f32, dy: f32) {
    let Ok(Object::Array(rect)) = annot.get_mut(b"Rect") else {
        return;
    };
    for (i, v) in rect.iter_mut().enumerate() {
        if let Some(n) = as_number(v) {
            *v = real(n + if i % 2 == 0 { dx } else { dy });
        }
    }
}

/// Draw `form` on top of page `page_id`, keeping its content, media box and
/// annotations. Font and image objects already imported through `shared` are
/// referenced instead of copied again.
pub fn composite(
    doc: &mut Document,
    page: u32,
    page_id: ObjectId,
    geometry: PageGeometry,
    form: OverlayForm,
    shared: &mut SharedObjects,
) -> Result<(), Error> {
    if !geometry.same_size(form.width, form.height) {
        return Err(Error::PageSizeMismatch {
            expected: (geometry.width, geometry.height),
            actual: (form.width, form.height),
        });
    }

    // Read everything from the page before the document is touched, so a
    // malformed page leaves the document as it was.
    let original = content_refs(doc, page, page_id)?;
    let (mut resources, mut xobjects) = page_resources(doc, page, page_id)?;
    let mut annots = page_annots(doc, page, page_id)?;

    let offset = doc.max_id;
    let fresh: Vec<ObjectId> = form
        .shared
        .iter()
        .filter(|id| !shared.imported.contains_key(*id))
        .copied()
        .collect();
    {
        let imported = &shared.imported;
        let form_shared = &form.shared;
        let reused = |id: &ObjectId| form_shared.contains(id) && imported.contains_key(id);
        let map = |id: ObjectId| match imported.get(&id) {
            Some(&target) if form_shared.contains(&id) => target,
            _ => (id.0 + offset, id.1),
        };
        for (id, obj) in form.objects {
            if reused(&id) {
                continue;
            }
            doc.objects.insert(map(id), renumber(obj, &map));
        }
    }
    doc.max_id = offset + form.max_id;
    for id in fresh {
        shared.imported.insert(id, (id.0 + offset, id.1));
    }

    let form_id = (form.form_id.0 + offset, form.form_id.1);
    for id in &form.annots {
        let id = (id.0 + offset, id.1);
        if let Some(Object::Dictionary(annot)) = doc.objects.get_mut(&id) {
            annot.set("P", Object::Reference(page_id));
            shift_rect(annot, geometry.x0, geometry.y0);
        }
        annots.push(Object::Reference(id));
    }

    let name = unused_name(&xobjects);
    xobjects.set(name.as_bytes().to_vec(), Object::Reference(form_id));
    resources.set("XObject", Object::Dictionary(xobjects));

    let open = doc.add_object(Stream::new(Dictionary::new(), b"q\n".to_vec()));
    let close = doc.add_object(Stream::new(Dictionary::new(), b"\nQ\n".to_vec()));
    let draw = doc.add_object(Stream::new(
        Dictionary::new(),
        format!("q 1 0 0 1 {} {} cm /{name} Do Q\n", geometry.x0, geometry.y0).into_bytes(),
    ));

    let mut contents = Vec::with_capacity(original.len() + 3);
    contents.push(Object::Reference(open));
    contents.extend(original);
    contents.push(Object::Reference(close));
    contents.push(Object::Reference(draw));

    let page_dict = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .map_err(|_| Error::merge(page, "page is not a dictionary"))?;
    page_dict.set("Contents", Object::Array(contents));
    page_dict.set("Resources", Object::Dictionary(resources));
    page_dict.set("Annots", Object::Array(annots));

    log::debug!("Page {page}: overlay drawn as /{name} ({form_id:?})");
    Ok(())
}
