use std::path::PathBuf;

use thiserror::Error;

/// Every failure of a stamping run. Each one is terminal for the run: no
/// output document is written.
#[derive(Debug, Error)]
pub enum Error {
    #[error("QR encoding failed: URL is {len} bytes, symbol holds at most {capacity} ({reason})")]
    Encoding {
        len: usize,
        capacity: usize,
        reason: String,
    },

    #[error("QR trimming failed: the generated symbol has no dark pixels")]
    EmptySymbol,

    #[error("caption font '{font}' could not be loaded: {reason}")]
    FontLoad { font: String, reason: String },

    #[error(
        "overlay size {:.2}x{:.2} does not match page size {:.2}x{:.2}",
        .actual.0, .actual.1, .expected.0, .expected.1
    )]
    PageSizeMismatch {
        expected: (f32, f32),
        actual: (f32, f32),
    },

    #[error("merge failed on page {page}: {reason}")]
    Merge { page: u32, reason: String },

    #[error("input document not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn font_load(font: &str, reason: impl std::fmt::Display) -> Self {
        Error::FontLoad {
            font: font.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Document-level merge failures (unreadable file, broken page tree) use page 0.
    pub(crate) fn merge(page: u32, reason: impl std::fmt::Display) -> Self {
        Error::Merge {
            page,
            reason: reason.to_string(),
        }
    }
}
