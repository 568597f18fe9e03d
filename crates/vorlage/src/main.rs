/*
 * main.rs
 * Copyright (c) 2025 Posit, PBC
 *
 * Compose a document and stream it to stdout or a file.
 */

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vorlage_compiler::{
    Action, ActionHandler, CompileRequest, Compiler, CompilerConfig, StreamingDocument,
};

#[derive(Parser, Debug)]
#[command(name = "vorlage")]
#[command(version)]
#[command(about = "Compose a document and stream the result", long_about = None)]
struct Args {
    /// Root document
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Scalar input (KEY=VALUE)
    #[arg(short = 'i', long = "input", value_parser = parse_key_value)]
    inputs: Vec<(String, String)>,

    /// Stream input read from a file (KEY=PATH)
    #[arg(short = 's', long = "stream", value_parser = parse_key_value)]
    streams: Vec<(String, String)>,

    /// Write output to FILE instead of stdout
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Compiler configuration (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Override macro-max-length from the configuration
    #[arg(long)]
    macro_max_length: Option<usize>,

    /// Override max-variable-length from the configuration
    #[arg(long)]
    max_variable_length: Option<usize>,

    /// Override read-buffer-size from the configuration
    #[arg(long)]
    read_buffer_size: Option<usize>,

    /// Size of the buffer used to pull output from the document
    #[arg(long, default_value_t = 8192)]
    buffer_size: usize,

    /// Print the documents the root includes instead of the output
    #[arg(long)]
    list_dependants: bool,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

/// Logs what processors ask of the request; there is no HTTP response here.
struct LoggingActionHandler;

impl ActionHandler for LoggingActionHandler {
    fn handle(&mut self, processor: &str, action: &Action) {
        match action {
            Action::HttpHeader(header) => {
                tracing::info!(processor, header = %header, "ignoring header");
            }
            other => tracing::debug!(processor, action = ?other, "processor action"),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = match args.verbose {
        0 => "vorlage=info",
        1 => "vorlage=debug",
        _ => "vorlage=trace",
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let mut config = match &args.config {
        Some(path) => CompilerConfig::load(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => CompilerConfig::default(),
    };
    if let Some(n) = args.macro_max_length {
        config.macro_max_length = n;
    }
    if let Some(n) = args.max_variable_length {
        config.max_variable_length = n;
    }
    if let Some(n) = args.read_buffer_size {
        config.read_buffer_size = n;
    }
    let compiler = Compiler::new(config).context("Invalid configuration")?;

    let mut request = CompileRequest::new(&args.file).inputs(args.inputs.iter().cloned());
    for (name, path) in &args.streams {
        let file =
            File::open(path).with_context(|| format!("Failed to open stream input {name}: {path}"))?;
        request = request.stream(name.clone(), Box::new(BufReader::new(file)));
    }

    let mut document = compiler
        .compile(request, &mut LoggingActionHandler)
        .with_context(|| format!("Failed to compile {}", args.file.display()))?;

    if args.list_dependants {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        for path in document.dependants() {
            writeln!(out, "{}", path.display())?;
        }
        document.close()?;
        return Ok(());
    }

    let written = match &args.output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            let mut out = BufWriter::new(file);
            let written = pump(&mut document, &mut out, args.buffer_size)?;
            out.flush()?;
            written
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            pump(&mut document, &mut out, args.buffer_size)?
        }
    };
    document
        .close()
        .with_context(|| format!("Failed to close {}", args.file.display()))?;
    tracing::debug!(bytes = written, "done");
    Ok(())
}

/// Copy the whole document into `out`, `buffer_size` bytes at a time.
fn pump(document: &mut StreamingDocument, out: &mut impl Write, buffer_size: usize) -> Result<u64> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = document
            .read(&mut buf)
            .context("Failed while streaming document")?;
        if n == 0 {
            return Ok(total);
        }
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
}
