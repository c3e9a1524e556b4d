use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

use docxside_merge::{Error, MergeConfig, ProcessingReport, TemplateFile};

#[derive(Parser)]
#[command(
    name = "docxside-merge",
    about = "Fill tokens and image placeholders in DOCX and XLSX templates"
)]
struct Args {
    /// JSON file with replacements, patterns and image placeholders
    #[arg(long)]
    config: PathBuf,
    /// Template file, or a directory of templates
    input: PathBuf,
    /// Directory the merged documents are written to
    #[arg(short, long, default_value = "output_docs")]
    output: PathBuf,
    /// Write every document's report to this JSON file
    #[arg(long)]
    report: Option<PathBuf>,
    /// Do not save documents whose report lists failures
    #[arg(long)]
    skip_failed: bool,
}

#[derive(Serialize)]
struct DocumentReport {
    input: PathBuf,
    output: Option<PathBuf>,
    #[serde(flatten)]
    report: ProcessingReport,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if !args.input.exists() {
        eprintln!("Error: file not found: {}", args.input.display());
        std::process::exit(1);
    }

    let start = Instant::now();
    let ok = match run(&args) {
        Ok(ok) => ok,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    println!("Done in {:.2}s", start.elapsed().as_secs_f64());
    if !ok {
        std::process::exit(1);
    }
}

/// Returns false when some document could not be loaded or saved.
fn run(args: &Args) -> Result<bool, Error> {
    let config = MergeConfig::from_path(&args.config)?;
    let tokens = config.token_map()?;
    let images = config.image_map()?;
    let inputs = templates(&args.input)?;
    if inputs.is_empty() {
        eprintln!("No .docx or .xlsx files in {}", args.input.display());
        return Ok(true);
    }
    std::fs::create_dir_all(&args.output)?;

    let mut ok = true;
    let mut reports = Vec::with_capacity(inputs.len());
    for input in inputs {
        let Some(name) = input.file_name() else {
            continue;
        };
        let output = args.output.join(name);
        let mut template = match TemplateFile::open(&input) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("Error: {}: {e}", input.display());
                ok = false;
                continue;
            }
        };
        let report = template.apply(&tokens, &images);
        println!("{}: {report}", input.display());
        for failure in &report.failures {
            println!("  {failure}");
        }

        let saved = if args.skip_failed && report.has_failures() {
            println!("  skipped, not saved");
            None
        } else {
            match template.save(&output) {
                Ok(()) => Some(output),
                Err(e) => {
                    eprintln!("Error: {}: {e}", input.display());
                    ok = false;
                    None
                }
            }
        };
        reports.push(DocumentReport {
            input,
            output: saved,
            report,
        });
    }

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&reports)?;
        std::fs::write(path, json)?;
    }
    Ok(ok)
}

fn templates(input: &Path) -> Result<Vec<PathBuf>, Error> {
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(input)? {
        let path = entry?.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("docx") || e.eq_ignore_ascii_case("xlsx"));
        // skip Office lock files
        let lock = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("~$"));
        if path.is_file() && supported && !lock {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
