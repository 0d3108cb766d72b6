use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use qr_stamp_pdf::{DEFAULT_FONT, StampOptions, stamp_pdf};

/// Stamp a clickable QR code with a caption onto every page of a PDF.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// PDF to stamp. Prompted for when omitted.
    input: Option<PathBuf>,

    /// URL encoded in the QR code. Prompted for when omitted.
    #[arg(short, long)]
    url: Option<String>,

    /// Directory for the stamped copy (default: next to the input, with a
    /// `_with_qr` suffix).
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Caption font: a path, font file name or family name. Names are looked
    /// up in QRSTAMP_FONTS and the system font directories only, so without
    /// GOST_A.TTF installed there pass a font path explicitly. The font needs
    /// Cyrillic glyphs.
    #[arg(short, long, default_value = DEFAULT_FONT)]
    font: String,

    /// Number of page workers.
    #[arg(short, long)]
    jobs: Option<usize>,

    /// More log output (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn prompt(label: &str) -> io::Result<String> {
    print!("{label}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let input = match args.input {
        Some(p) => p,
        None => PathBuf::from(prompt("PDF file")?),
    };
    let url = match args.url {
        Some(u) => u,
        None => prompt("URL")?,
    };

    let options = StampOptions {
        out_dir: args.out_dir,
        font: args.font,
        jobs: args.jobs,
    };
    let report = stamp_pdf(&input, &url, &options)?;
    println!(
        "{} ({} pages, {:.2}s)",
        report.output.display(),
        report.pages,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
