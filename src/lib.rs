pub mod compose;
mod error;
pub mod fonts;
pub mod model;
pub mod overlay;
pub mod placement;
pub mod qr;
mod stamp;

pub use error::Error;
pub use fonts::{CaptionFont, DEFAULT_FONT, FontRegistry};
pub use stamp::{
    OUTPUT_SUFFIX, RunState, StampOptions, StampReport, StampRun, output_path, stamp_bytes,
    stamp_pdf,
};
