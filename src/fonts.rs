use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use pdf_writer::{Name, Pdf, Rect, Ref, Str};
use ttf_parser::Face;

use crate::error::Error;

/// Caption font resource used when none is configured.
pub const DEFAULT_FONT: &str = "GOST_A.TTF";

/// A TrueType face parsed and subset once per run for a fixed text.
///
/// Holds everything needed to embed the font into any number of overlays
/// without touching the font file again.
#[derive(Debug)]
pub struct CaptionFont {
    name: String,
    ps_name: String,
    subset: Vec<u8>,
    bbox: Rect,
    ascent: f32,
    descent: f32,
    cap_height: f32,
    ascender_ratio: f32,
    char_to_gid: BTreeMap<char, u16>,
    char_widths_1000: BTreeMap<char, f32>,
}

impl CaptionFont {
    /// Load face `face_index` of `path`, subset to the glyphs of `text`.
    pub(crate) fn load(name: &str, path: &Path, face_index: u32, text: &str) -> Result<Self, Error> {
        let t0 = std::time::Instant::now();
        let file = std::fs::File::open(path)
            .map_err(|e| Error::font_load(name, format!("{}: {e}", path.display())))?;
        let data = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::font_load(name, format!("{}: {e}", path.display())))?;
        let face = Face::parse(&data, face_index).map_err(|e| Error::font_load(name, e))?;

        let units = face.units_per_em() as f32;
        let ascent = face.ascender() as f32 / units * 1000.0;
        let descent = face.descender() as f32 / units * 1000.0;
        let cap_height = face
            .capital_height()
            .map(|h| h as f32 / units * 1000.0)
            .unwrap_or(700.0);

        let bb = face.global_bounding_box();
        let bbox = Rect::new(
            bb.x_min as f32 / units * 1000.0,
            bb.y_min as f32 / units * 1000.0,
            bb.x_max as f32 / units * 1000.0,
            bb.y_max as f32 / units * 1000.0,
        );

        // Ordered so the remapped glyph ids and the subset bytes are the same every run.
        let used: BTreeSet<char> = text.chars().chain([' ']).collect();
        let mut remapper = subsetter::GlyphRemapper::new();
        let mut char_to_gid = BTreeMap::new();
        let mut char_widths_1000 = BTreeMap::new();
        let mut missing = Vec::new();
        for &ch in &used {
            let Some(gid) = face.glyph_index(ch) else {
                if ch.is_whitespace() {
                    log::warn!("Font {name} has no glyph for {ch:?}");
                } else {
                    missing.push(format!("{ch:?}"));
                }
                continue;
            };
            char_to_gid.insert(ch, remapper.remap(gid.0));
            let w = face
                .glyph_hor_advance(gid)
                .map(|adv| adv as f32 / units * 1000.0)
                .unwrap_or(0.0);
            char_widths_1000.insert(ch, w);
        }
        if !missing.is_empty() {
            return Err(Error::font_load(name, format!("no glyph for {}", missing.join(", "))));
        }

        let subset = subsetter::subset(&data, face_index, &remapper)
            .map_err(|e| Error::font_load(name, format!("subsetting failed: {e}")))?;

        let ps_name = postscript_name(&face).unwrap_or_else(|| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("CaptionFont")
                .to_string()
        });
        let ps_name: String = ps_name
            .chars()
            .filter(|c| c.is_ascii_graphic() && !"[](){}<>/%#".contains(*c))
            .collect();

        log::debug!(
            "Loaded caption font {name} ({}, face {face_index}): {} glyphs, subset {} bytes, {:.1}ms",
            path.display(),
            char_to_gid.len(),
            subset.len(),
            t0.elapsed().as_secs_f64() * 1000.0,
        );

        Ok(CaptionFont {
            name: name.to_string(),
            ps_name,
            subset,
            bbox,
            ascent,
            descent,
            cap_height,
            ascender_ratio: face.ascender() as f32 / units,
            char_to_gid,
            char_widths_1000,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text_width(&self, text: &str, font_size: f32) -> f32 {
        text.chars()
            .map(|ch| self.char_widths_1000.get(&ch).copied().unwrap_or(0.0) * font_size / 1000.0)
            .sum()
    }

    /// Height above the baseline at `font_size`.
    pub fn ascent(&self, font_size: f32) -> f32 {
        self.ascender_ratio * font_size
    }

    /// Encode text as big-endian 2-byte glyph ids for the Identity-H font.
    pub(crate) fn encode(&self, text: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(text.len() * 2);
        for ch in text.chars() {
            let gid = self.char_to_gid.get(&ch).copied().unwrap_or(0);
            out.push((gid >> 8) as u8);
            out.push((gid & 0xFF) as u8);
        }
        out
    }

    /// Embed as a CIDFont (Type0 composite) with Identity-H encoding.
    pub(crate) fn write(&self, pdf: &mut Pdf, font_ref: Ref, alloc: &mut impl FnMut() -> Ref) {
        let descriptor_ref = alloc();
        let data_ref = alloc();
        let cid_font_ref = alloc();
        let tounicode_ref = alloc();

        pdf.stream(data_ref, &self.subset)
            .pair(Name(b"Length1"), self.subset.len() as i32);

        pdf.font_descriptor(descriptor_ref)
            .name(Name(self.ps_name.as_bytes()))
            .flags(pdf_writer::types::FontFlags::NON_SYMBOLIC)
            .bbox(self.bbox)
            .italic_angle(0.0)
            .ascent(self.ascent)
            .descent(self.descent)
            .cap_height(self.cap_height)
            .stem_v(80.0)
            .font_file2(data_ref);

        let system_info = pdf_writer::types::SystemInfo {
            registry: Str(b"Adobe"),
            ordering: Str(b"Identity"),
            supplement: 0,
        };
        {
            let mut cid = pdf.cid_font(cid_font_ref);
            cid.subtype(pdf_writer::types::CidFontType::Type2);
            cid.base_font(Name(self.ps_name.as_bytes()));
            cid.system_info(system_info);
            cid.font_descriptor(descriptor_ref);
            cid.default_width(0.0);
            cid.cid_to_gid_map_predefined(Name(b"Identity"));
            let mut gid_widths: Vec<(u16, f32)> = self
                .char_to_gid
                .iter()
                .map(|(ch, &gid)| (gid, self.char_widths_1000.get(ch).copied().unwrap_or(0.0)))
                .collect();
            gid_widths.sort_by_key(|&(gid, _)| gid);
            gid_widths.dedup_by_key(|&mut (gid, _)| gid);
            if !gid_widths.is_empty() {
                let mut w = cid.widths();
                for &(gid, width) in &gid_widths {
                    w.consecutive(gid, [width]);
                }
            }
        }

        let cmap_name = format!("{}-UTF16", self.ps_name);
        let mut cmap = pdf_writer::types::UnicodeCmap::new(
            Name(cmap_name.as_bytes()),
            pdf_writer::types::SystemInfo {
                registry: Str(b"Adobe"),
                ordering: Str(b"Identity"),
                supplement: 0,
            },
        );
        for (&ch, &gid) in &self.char_to_gid {
            cmap.pair(gid, ch);
        }
        let cmap_data = cmap.finish();
        pdf.stream(tounicode_ref, cmap_data.as_slice());

        pdf.type0_font(font_ref)
            .base_font(Name(self.ps_name.as_bytes()))
            .encoding_predefined(Name(b"Identity-H"))
            .descendant_font(cid_font_ref)
            .to_unicode(tounicode_ref);
    }
}

/// Fonts registered for a run, keyed by the resolved file and face.
///
/// Registering the same resource again returns the handle loaded the first time.
#[derive(Default)]
pub struct FontRegistry {
    resolved: HashMap<String, (PathBuf, u32)>,
    fonts: HashMap<(PathBuf, u32), Arc<CaptionFont>>,
}

impl FontRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `font` (a path, a file name or a family name), load it and
    /// subset it for the caption.
    pub fn register(&mut self, font: &str) -> Result<Arc<CaptionFont>, Error> {
        let key = match self.resolved.get(font) {
            Some(key) => key.clone(),
            None => {
                let key = resolve_font(font)?;
                self.resolved.insert(font.to_string(), key.clone());
                key
            }
        };
        if let Some(loaded) = self.fonts.get(&key) {
            log::debug!("Font {font} already registered");
            return Ok(Arc::clone(loaded));
        }
        let loaded = Arc::new(CaptionFont::load(font, &key.0, key.1, crate::overlay::CAPTION)?);
        self.fonts.insert(key, Arc::clone(&loaded));
        Ok(loaded)
    }
}

fn font_family_name(face: &Face) -> Option<String> {
    for name in face.names() {
        if name.name_id == ttf_parser::name_id::FAMILY
            && name.is_unicode()
            && let Some(s) = name.to_string()
        {
            return Some(s);
        }
    }
    None
}

fn postscript_name(face: &Face) -> Option<String> {
    face.names()
        .into_iter()
        .filter(|n| n.name_id == ttf_parser::name_id::POST_SCRIPT_NAME && n.is_unicode())
        .find_map(|n| n.to_string())
        .or_else(|| font_family_name(face))
}

pub(crate) fn font_directories() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();

    // 1. User-configured directories via QRSTAMP_FONTS env var
    if let Ok(val) = std::env::var("QRSTAMP_FONTS") {
        let sep = if cfg!(windows) { ';' } else { ':' };
        for part in val.split(sep) {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                dirs.push(PathBuf::from(trimmed));
            }
        }
    }

    // 2. Platform-specific system font directories
    #[cfg(target_os = "macos")]
    {
        dirs.extend([
            "/Library/Fonts".into(),
            "/System/Library/Fonts".into(),
            "/System/Library/Fonts/Supplemental".into(),
        ]);
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(&home).join("Library/Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        dirs.extend(["/usr/share/fonts".into(), "/usr/local/share/fonts".into()]);
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join(".local/share/fonts"));
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        } else {
            dirs.push("C:\\Windows\\Fonts".into());
        }
    }

    dirs
}

pub(crate) fn is_font_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("ttf" | "otf" | "ttc")
    )
}

fn is_font_collection(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("ttc"))
}

/// Font files under `dirs`, recursively, in a stable order.
fn list_font_files(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut visited = std::collections::HashSet::new();
    let mut stack = dirs;
    stack.reverse();
    while let Some(dir) = stack.pop() {
        if !visited.insert(dir.clone()) {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        let mut subdirs = Vec::new();
        for path in paths {
            if path.is_dir() {
                subdirs.push(path);
            } else if is_font_file(&path) {
                files.push(path);
            }
        }
        subdirs.reverse();
        stack.extend(subdirs);
    }
    files
}

/// Find the file for a font resource: an existing path (relative paths are
/// taken from the working directory), a font file name (case-insensitive) or
/// a family name.
pub(crate) fn resolve_font(font: &str) -> Result<(PathBuf, u32), Error> {
    let t0 = std::time::Instant::now();
    let path = Path::new(font);
    if path.is_file() {
        return Ok((path.to_path_buf(), 0));
    }
    if path.components().count() > 1 {
        return Err(Error::font_load(font, format!("no such file: {}", path.display())));
    }

    let wanted = font.to_lowercase();
    let files = list_font_files(font_directories());

    let by_file_name = files.iter().find(|p| {
        p.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.to_lowercase() == wanted)
    });
    if let Some(found) = by_file_name {
        log::debug!("Resolved font {font} → {}", found.display());
        return Ok((found.clone(), 0));
    }

    for file_path in &files {
        let Ok(file) = std::fs::File::open(file_path) else {
            continue;
        };
        let Ok(data) = (unsafe { Mmap::map(&file) }) else {
            continue;
        };
        let face_count = if is_font_collection(file_path) {
            ttf_parser::fonts_in_collection(&data).unwrap_or(1)
        } else {
            1
        };
        for face_idx in 0..face_count {
            let Ok(face) = Face::parse(&data, face_idx) else {
                continue;
            };
            if face.is_bold() || face.is_italic() {
                continue;
            }
            if font_family_name(&face).is_some_and(|f| f.to_lowercase() == wanted) {
                log::debug!(
                    "Resolved font family {font} → {} (face {face_idx}) in {:.1}ms",
                    file_path.display(),
                    t0.elapsed().as_secs_f64() * 1000.0,
                );
                return Ok((file_path.clone(), face_idx));
            }
        }
    }

    Err(Error::font_load(
        font,
        format!("not found in {} font files (set QRSTAMP_FONTS to add directories)", files.len()),
    ))
}

/// The caption font used by tests: `QRSTAMP_TEST_FONT`, else DejaVu Sans
/// from the system font directories.
#[cfg(test)]
pub(crate) fn test_caption_font() -> Option<Arc<CaptionFont>> {
    let name = std::env::var("QRSTAMP_TEST_FONT").unwrap_or_else(|_| "DejaVuSans.ttf".into());
    let font = FontRegistry::new().register(&name).ok();
    if font.is_none() {
        println!("caption font {name} not available, skipping");
    }
    font
}
