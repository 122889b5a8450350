//! gedcom-transport CLI
//!
//! Inspect, dump and transcode GEDCOM files.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use gedcom_transport::{
    Decoder, Document, Encoder, Encoding, LineReader, LineTerminator, RecordNode, DEFAULT_MAX_LINE_WIDTH,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "gedcom-transport")]
#[command(author = "nzinfo <li.monan@gmail.com>")]
#[command(version)]
#[command(about = "GEDCOM encoding and line transport tool")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report the encoding of GEDCOM files
    Detect {
        /// Files and directories to scan
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Print the physical lines of a file
    Lines {
        /// GEDCOM file to read
        input: PathBuf,

        /// Read as this declared character set instead of the detected one
        #[arg(short, long)]
        charset: Option<String>,
    },

    /// Print the record tree of a file
    Tree {
        /// GEDCOM file to read
        input: PathBuf,
    },

    /// Rewrite a file in another encoding
    Transcode {
        /// GEDCOM file to read
        input: PathBuf,

        /// Output file (default: stdout)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Target encoding
        #[arg(short, long, value_enum, default_value_t = EncodingArg::Utf8)]
        encoding: EncodingArg,

        /// Line terminator
        #[arg(short, long, value_enum, default_value_t = TerminatorArg::Crlf)]
        terminator: TerminatorArg,

        /// Maximum line width before values are continued with CONC
        #[arg(short = 'w', long, default_value_t = DEFAULT_MAX_LINE_WIDTH)]
        max_width: usize,

        /// Write a byte-order mark (UTF-8 and UTF-16 only)
        #[arg(long)]
        bom: bool,

        /// Print write progress to stderr every N lines
        #[arg(long)]
        progress: Option<usize>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EncodingArg {
    Ascii,
    Ansel,
    Utf8,
    Utf16be,
    Utf16le,
}

impl From<EncodingArg> for Encoding {
    fn from(arg: EncodingArg) -> Self {
        match arg {
            EncodingArg::Ascii => Encoding::Ascii,
            EncodingArg::Ansel => Encoding::Ansel,
            EncodingArg::Utf8 => Encoding::Utf8,
            EncodingArg::Utf16be => Encoding::Utf16Be,
            EncodingArg::Utf16le => Encoding::Utf16Le,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TerminatorArg {
    Cr,
    Lf,
    Crlf,
}

impl From<TerminatorArg> for LineTerminator {
    fn from(arg: TerminatorArg) -> Self {
        match arg {
            TerminatorArg::Cr => LineTerminator::Cr,
            TerminatorArg::Lf => LineTerminator::Lf,
            TerminatorArg::Crlf => LineTerminator::CrLf,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Detect { inputs } => {
            detect_files(&inputs)?;
        }
        Commands::Lines { input, charset } => {
            print_lines(&input, charset.as_deref())?;
        }
        Commands::Tree { input } => {
            print_tree(&input)?;
        }
        Commands::Transcode { input, output, encoding, terminator, max_width, bom, progress } => {
            let mut encoder = Encoder::new()
                .with_encoding(encoding.into())
                .with_terminator(terminator.into())
                .with_byte_order_mark(bom)
                .with_max_line_width(max_width)?;
            if let Some(rate) = progress {
                encoder.set_write_notification_rate(rate)?;
                encoder.register_file_observer(|e| eprintln!("{}", e));
            }
            transcode(&input, output.as_deref(), encoder)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn read_document(input: &Path) -> Result<Document> {
    Decoder::new()
        .decode_file(input)
        .with_context(|| format!("Failed to decode: {}", input.display()))
}

fn detect_files(inputs: &[PathBuf]) -> Result<()> {
    for input in inputs {
        if input.is_dir() {
            for entry in walkdir::WalkDir::new(input)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && is_gedcom(e.path()))
            {
                detect_one(entry.path());
            }
        } else {
            detect_one(input);
        }
    }
    Ok(())
}

fn is_gedcom(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("ged"))
        .unwrap_or(false)
}

/// Failures are reported per file so one bad file does not stop a scan.
fn detect_one(path: &Path) {
    match Decoder::new().decode_file(path) {
        Ok(doc) => {
            let bom = if doc.had_bom { " (BOM)" } else { "" };
            println!(
                "{}  {}{}  {} lines  {} records",
                path.display(),
                doc.encoding,
                bom,
                doc.lines_read,
                doc.records().len()
            );
        }
        Err(e) => println!("{}  error: {}", path.display(), e),
    }
}

fn print_lines(input: &Path, charset: Option<&str>) -> Result<()> {
    let file = File::open(input).with_context(|| format!("Failed to open: {}", input.display()))?;
    let mut reader = LineReader::new(file)?;
    if charset.is_some() {
        reader.confirm_encoding(charset)?;
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    while let Some(line) = reader.next_line()? {
        writeln!(out, "{:>6}  {}", reader.lines_read(), line)?;
    }
    out.flush()?;
    Ok(())
}

fn print_tree(input: &Path) -> Result<()> {
    let doc = read_document(input)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    for record in doc.records() {
        write_node(&mut out, record)?;
    }
    out.flush()?;
    Ok(())
}

fn write_node<W: Write>(out: &mut W, node: &RecordNode) -> Result<()> {
    let indent = "  ".repeat(usize::try_from(node.level).unwrap_or(0));
    let xref = node.xref.as_deref().map(|x| format!("{} ", x)).unwrap_or_default();
    match &node.value {
        Some(value) => writeln!(out, "{}{}{} {:?}", indent, xref, node.tag, value)?,
        None => writeln!(out, "{}{}{}", indent, xref, node.tag)?,
    }
    for child in &node.children {
        write_node(out, child)?;
    }
    Ok(())
}

fn transcode(input: &Path, output: Option<&Path>, mut encoder: Encoder) -> Result<()> {
    let mut doc = read_document(input)?;
    if !doc.set_declared_charset(encoder.encoding()) {
        log::warn!("{} has no header; CHAR not updated", input.display());
    }

    let summary = match output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create: {}", path.display()))?;
            let summary = encoder.encode_document(&doc, BufWriter::new(file))?;
            log::info!("Created: {} ({} bytes)", path.display(), summary.bytes_written);
            summary
        }
        None => encoder.encode_document(&doc, io::stdout().lock())?,
    };

    log::info!(
        "Transcoded {} from {} to {}: {} lines",
        input.display(),
        doc.encoding,
        encoder.encoding(),
        summary.lines_written
    );
    Ok(())
}
