use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lopdf::{Document, ObjectId};
use rayon::prelude::*;

use crate::compose::{self, OverlayForm, SharedObjects};
use crate::error::Error;
use crate::fonts::{CaptionFont, DEFAULT_FONT, FontRegistry};
use crate::model::PageGeometry;
use crate::overlay;
use crate::placement::{self, MIN_PAGE_HEIGHT, MIN_PAGE_WIDTH};
use crate::qr::{self, QrImage};

/// Suffix added to the input file stem when no output directory is given.
pub const OUTPUT_SUFFIX: &str = "_with_qr";

/// Settings for one stamping run.
#[derive(Clone, Debug)]
pub struct StampOptions {
    /// Write into this directory under the input's file name instead of next
    /// to the input.
    pub out_dir: Option<PathBuf>,
    /// Caption font: a path, a font file name or a family name.
    pub font: String,
    /// Page workers; `None` uses the available parallelism.
    pub jobs: Option<usize>,
}

impl Default for StampOptions {
    fn default() -> Self {
        StampOptions {
            out_dir: None,
            font: DEFAULT_FONT.to_string(),
            jobs: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct StampReport {
    pub output: PathBuf,
    pub pages: usize,
    pub elapsed: Duration,
}

/// Progress of a run. `Finalized` and `Failed` are terminal.
#[derive(Clone, Debug, PartialEq)]
pub enum RunState {
    Idle,
    SymbolGenerated,
    Trimmed,
    Rendering { pages: usize },
    Compositing { page: u32 },
    Finalized,
    Failed(String),
}

/// One pipeline run: a URL, a registered caption font and a worker pool.
///
/// The QR symbol is generated and trimmed once; every page then shares it
/// and the font read-only.
pub struct StampRun {
    url: String,
    font: Arc<CaptionFont>,
    pool: rayon::ThreadPool,
    qr: Option<QrImage>,
    state: RunState,
}

impl StampRun {
    pub fn new(url: &str, font: Arc<CaptionFont>, jobs: Option<usize>) -> Result<Self, Error> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("qr-stamp-{i}"));
        if let Some(n) = jobs {
            builder = builder.num_threads(n.max(1));
        }
        let pool = builder.build().map_err(|e| Error::Io(std::io::Error::other(e)))?;
        Ok(StampRun {
            url: url.to_string(),
            font,
            pool,
            qr: None,
            state: RunState::Idle,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn advance(&mut self, next: RunState) {
        log::debug!("Run state: {:?} → {next:?}", self.state);
        self.state = next;
    }

    fn fail<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            self.advance(RunState::Failed(e.to_string()));
        }
        result
    }

    /// Generate and trim the QR symbol. Later calls reuse the first result.
    pub fn prepare(&mut self) -> Result<(), Error> {
        if self.qr.is_some() {
            return Ok(());
        }
        let raster = qr::generate(&self.url);
        let raster = self.fail(raster)?;
        self.advance(RunState::SymbolGenerated);
        let trimmed = qr::trim(&raster);
        self.qr = Some(self.fail(trimmed)?);
        self.advance(RunState::Trimmed);
        Ok(())
    }

    /// Stamp every page of `doc` in place. On error the document may hold
    /// imported overlay objects and must not be saved.
    pub fn stamp_document(&mut self, doc: &mut Document) -> Result<usize, Error> {
        self.prepare()?;
        let result = self.stamp_pages(doc);
        self.fail(result)
    }

    fn stamp_pages(&mut self, doc: &mut Document) -> Result<usize, Error> {
        let t0 = Instant::now();

        let pages: Vec<(u32, ObjectId, PageGeometry)> = doc
            .get_pages()
            .into_iter()
            .map(|(page, page_id)| {
                compose::page_geometry(&*doc, page, page_id).map(|g| (page, page_id, g))
            })
            .collect::<Result<_, Error>>()?;

        self.advance(RunState::Rendering { pages: pages.len() });
        let qr = self.qr.as_ref().ok_or(Error::EmptySymbol)?;
        let forms = self.render_pages(qr, &pages)?;
        let t_render = t0.elapsed();

        let mut shared = SharedObjects::new();
        for ((page, page_id, geometry), form) in pages.iter().zip(forms) {
            self.advance(RunState::Compositing { page: *page });
            compose::composite(doc, *page, *page_id, *geometry, form, &mut shared)?;
        }
        let t_composite = t0.elapsed();

        log::info!(
            "Timing: render={:.1}ms, composite={:.1}ms, total={:.1}ms ({} pages)",
            t_render.as_secs_f64() * 1000.0,
            (t_composite - t_render).as_secs_f64() * 1000.0,
            t_composite.as_secs_f64() * 1000.0,
            pages.len(),
        );

        Ok(pages.len())
    }

    /// Place, render and parse every overlay on the worker pool. Results come
    /// back in page order; the first failure stops the remaining pages.
    fn render_pages(
        &self,
        qr: &QrImage,
        pages: &[(u32, ObjectId, PageGeometry)],
    ) -> Result<Vec<OverlayForm>, Error> {
        let url = self.url.as_str();
        let font = self.font.as_ref();
        self.pool.install(|| {
            pages
                .par_iter()
                .map(|&(page, _, geometry)| {
                    if geometry.width < MIN_PAGE_WIDTH || geometry.height < MIN_PAGE_HEIGHT {
                        log::warn!(
                            "Page {page} is {:.1}x{:.1}, smaller than {MIN_PAGE_WIDTH:.1}x{MIN_PAGE_HEIGHT:.1}; the stamp may be clipped",
                            geometry.width,
                            geometry.height,
                        );
                    }
                    let placement = placement::place(geometry);
                    let surface =
                        overlay::render(qr, &placement, url, font, geometry.width, geometry.height)?;
                    OverlayForm::from_surface(page, &surface)
                })
                .collect()
        })
    }

    /// Serialize `doc` to `output`. The bytes go to a temporary file next to
    /// `output` that only replaces it once fully written.
    pub fn finalize(&mut self, doc: &mut Document, output: &Path) -> Result<(), Error> {
        let result = write_atomically(doc, output);
        self.finish(result)
    }

    /// Serialize `doc` into memory.
    pub fn finalize_to_vec(&mut self, doc: &mut Document) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let result = save(doc, &mut out).map(|()| out);
        self.finish(result)
    }

    fn finish<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        let value = self.fail(result)?;
        self.advance(RunState::Finalized);
        Ok(value)
    }
}

fn save(doc: &mut Document, writer: &mut impl Write) -> Result<(), Error> {
    doc.save_to(writer)
        .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
    Ok(())
}

fn write_atomically(doc: &mut Document, output: &Path) -> Result<(), Error> {
    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".qr-stamp-")
        .suffix(".part")
        .tempfile_in(dir)?;
    {
        let mut writer = std::io::BufWriter::new(tmp.as_file_mut());
        save(doc, &mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(output).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn suffixed_name(input: &Path) -> OsString {
    let mut name = input
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| OsString::from("output"));
    name.push(OUTPUT_SUFFIX);
    if let Some(ext) = input.extension() {
        name.push(".");
        name.push(ext);
    }
    name
}

fn same_location(a: &Path, b: &Path) -> bool {
    let canonical = |p: &Path| -> Option<PathBuf> {
        let parent = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
        Some(parent.canonicalize().ok()?.join(p.file_name()?))
    };
    match (canonical(a), canonical(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

/// Where the stamped copy of `input` goes.
///
/// Without `out_dir`: `<stem>_with_qr.<ext>` next to the input. With it:
/// the input's file name inside `out_dir`, unless that is the input itself,
/// in which case the suffixed name is used there too.
pub fn output_path(input: &Path, out_dir: Option<&Path>) -> PathBuf {
    match out_dir {
        Some(dir) => {
            let candidate = match input.file_name() {
                Some(name) => dir.join(name),
                None => dir.join(suffixed_name(input)),
            };
            if same_location(&candidate, input) {
                dir.join(suffixed_name(input))
            } else {
                candidate
            }
        }
        None => input.with_file_name(suffixed_name(input)),
    }
}

/// Stamp `input` with a QR code for `url` and write the result per `options`.
///
/// Either the whole document is written or nothing is.
pub fn stamp_pdf(input: &Path, url: &str, options: &StampOptions) -> Result<StampReport, Error> {
    let t0 = Instant::now();

    if !input.exists() {
        return Err(Error::InputNotFound(input.to_path_buf()));
    }
    let output = output_path(input, options.out_dir.as_deref());

    let font = FontRegistry::new().register(&options.font)?;
    let t_font = t0.elapsed();

    let mut run = StampRun::new(url, font, options.jobs)?;
    run.prepare()?;
    let t_symbol = t0.elapsed();

    let mut doc = compose::load_document(input)?;
    let t_load = t0.elapsed();

    let pages = run.stamp_document(&mut doc)?;
    let t_stamp = t0.elapsed();

    run.finalize(&mut doc, &output)?;
    let elapsed = t0.elapsed();

    log::info!(
        "Timing: font={:.1}ms, symbol={:.1}ms, load={:.1}ms, stamp={:.1}ms, write={:.1}ms, total={:.1}ms",
        t_font.as_secs_f64() * 1000.0,
        (t_symbol - t_font).as_secs_f64() * 1000.0,
        (t_load - t_symbol).as_secs_f64() * 1000.0,
        (t_stamp - t_load).as_secs_f64() * 1000.0,
        (elapsed - t_stamp).as_secs_f64() * 1000.0,
        elapsed.as_secs_f64() * 1000.0,
    );

    Ok(StampReport {
        output,
        pages,
        elapsed,
    })
}

/// In-memory variant of [`stamp_pdf`] for an already registered font.
pub fn stamp_bytes(
    input: &[u8],
    url: &str,
    font: Arc<CaptionFont>,
    jobs: Option<usize>,
) -> Result<Vec<u8>, Error> {
    let mut run = StampRun::new(url, font, jobs)?;
    run.prepare()?;
    let mut doc = compose::load_document_mem(input)?;
    run.stamp_document(&mut doc)?;
    run.finalize_to_vec(&mut doc)
}
