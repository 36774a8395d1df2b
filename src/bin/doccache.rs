//! CLI binary for doccache.
//!
//! A thin shim over the library crate that maps CLI flags to `CacheConfig`,
//! wires up a converter and an optional notifier, and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use doccache::request::{self, LoadedInput};
use doccache::{
    fingerprint, BatchItem, CacheConfig, CacheWrite, CommandConverter, ConversionProgressCallback,
    ConversionRequest, ConversionService, Converter, Format, FormatPair, HttpConverter,
    HttpNotifier, Notifier, Origin, OutboxNotifier, PipelineError, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar for the batch, one log line per input.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self { bar })
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} files  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }

    fn on_request_start(&self, label: &str) {
        self.bar.set_message(label.to_string());
    }

    fn on_cache_hit(&self, label: &str, bytes: usize) {
        self.bar.println(format!(
            "  {} {:<32} {}  {}",
            green("✓"),
            label,
            cyan("cache hit"),
            dim(&format!("{bytes:>9} bytes")),
        ));
    }

    fn on_convert_start(&self, label: &str) {
        self.bar.set_message(format!("{label} (converting)"));
    }

    fn on_convert_complete(&self, label: &str, bytes: usize, duration_ms: u64) {
        self.bar.println(format!(
            "  {} {:<32} {}  {}  {}",
            green("✓"),
            label,
            "converted",
            dim(&format!("{bytes:>9} bytes")),
            dim(&format!("{:.1}s", duration_ms as f64 / 1000.0)),
        ));
    }

    fn on_cache_write(&self, label: &str, write: CacheWrite) {
        if write == CacheWrite::CounterpartOwned {
            self.bar.println(format!(
                "  {} {:<32} {}",
                cyan("⚠"),
                label,
                dim("not cached: output already belongs to another input")
            ));
        }
    }

    fn on_delivered(&self, label: &str, destination: &str) {
        self.bar
            .println(format!("  {} {:<32} → {}", cyan("✉"), label, destination));
    }

    fn on_failed(&self, label: &str, error: &str) {
        let first_line = error.lines().next().unwrap_or(error);
        let msg: String = if first_line.chars().count() > 80 {
            format!("{}\u{2026}", first_line.chars().take(79).collect::<String>())
        } else {
            first_line.to_string()
        };
        self.bar
            .println(format!("  {} {:<32} {}", red("✗"), label, red(&msg)));
    }

    fn on_request_complete(&self, _index: usize, _label: &str, _ok: bool) {
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, succeeded: usize) {
        let failed = total.saturating_sub(succeeded);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!("{} {} files done", green("✔"), bold(&succeeded.to_string()));
        } else {
            eprintln!(
                "{} {}/{} files done  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&succeeded.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const LIBREOFFICE_ARGS: &str = "--headless --convert-to {target} --outdir {outdir} {input}";

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a document (result on stdout)
  doccache report.docx > report.pdf

  # Convert several files into a directory
  doccache -o out/ *.docx

  # The reverse direction is served from the same cache
  doccache -o back/ out/report.pdf

  # Deliver by email through a mail API
  doccache --deliver-to user@example.com --mail-endpoint https://mail.example.com/send report.docx

  # Deliver into a local outbox directory
  doccache --outbox ./outbox --deliver-to team report.docx

  # Check whether a file is cached, without converting
  doccache --lookup-only report.docx

  # Track a different pair, with ffmpeg as the converter
  doccache --pair mp4:mp3 --converter-cmd ffmpeg --converter-args "-y -i {input} {output}" talk.mp4

CONVERTER ARGUMENT PLACEHOLDERS:
  {input}   path of the input file      {outdir}  directory to write into
  {output}  expected output path        {source}  source extension
  {target}  target extension

ENVIRONMENT VARIABLES:
  DOCCACHE_DATA_DIR     Directory holding conversions.db
  RUST_LOG              Override the log filter (e.g. doccache=debug)
"#;

/// Cache document conversions by content fingerprint.
#[derive(Parser, Debug)]
#[command(
    name = "doccache",
    version,
    about = "Convert documents through a content-addressed cache",
    long_about = "Convert documents (office ⇄ PDF by default) through a content-addressed \
cache. Every input is fingerprinted; a document converted once is served from SQLite in \
both directions afterwards, without running the converter again.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local file paths or HTTP/HTTPS URLs.
    #[arg(required_unless_present = "stats")]
    inputs: Vec<String>,

    /// Target format. Default: the other side of --pair.
    #[arg(long, env = "DOCCACHE_TO")]
    to: Option<Format>,

    /// Source format. Default: inferred from the file extension.
    #[arg(long, env = "DOCCACHE_FROM")]
    from: Option<Format>,

    /// The two formats this cache tracks, e.g. docx:pdf.
    #[arg(long, env = "DOCCACHE_PAIR", default_value = "docx:pdf")]
    pair: FormatPair,

    /// SQLite database file. Default: $DOCCACHE_DATA_DIR/conversions.db or the platform data dir.
    #[arg(long, env = "DOCCACHE_DB")]
    db: Option<PathBuf>,

    /// Deliver each result to this address (or outbox label).
    #[arg(long, env = "DOCCACHE_DELIVER_TO")]
    deliver_to: Option<String>,

    /// Deliver into this directory instead of sending mail.
    #[arg(long, env = "DOCCACHE_OUTBOX")]
    outbox: Option<PathBuf>,

    /// Mail API endpoint used for delivery.
    #[arg(long, env = "DOCCACHE_MAIL_ENDPOINT")]
    mail_endpoint: Option<String>,

    /// Bearer token for the mail API.
    #[arg(long, env = "DOCCACHE_MAIL_TOKEN", hide_env_values = true)]
    mail_token: Option<String>,

    /// Sender address for delivered mail.
    #[arg(long, env = "DOCCACHE_MAIL_FROM", default_value = "doccache@localhost")]
    mail_from: String,

    /// Converter program.
    #[arg(long, env = "DOCCACHE_CONVERTER_CMD", default_value = "soffice")]
    converter_cmd: String,

    /// Converter argument template (see placeholders below).
    #[arg(long, env = "DOCCACHE_CONVERTER_ARGS", default_value = LIBREOFFICE_ARGS)]
    converter_args: String,

    /// Use a remote conversion API instead of a local program.
    #[arg(long, env = "DOCCACHE_CONVERTER_URL")]
    converter_url: Option<String>,

    /// Bearer token for the conversion API.
    #[arg(long, env = "DOCCACHE_CONVERTER_TOKEN", hide_env_values = true)]
    converter_token: Option<String>,

    /// Write results into this directory.
    #[arg(short, long, env = "DOCCACHE_OUTPUT")]
    output: Option<PathBuf>,

    /// Report cache hit or miss without converting.
    #[arg(long)]
    lookup_only: bool,

    /// Print each input's fingerprint and exit.
    #[arg(long)]
    fingerprint_only: bool,

    /// Print store statistics.
    #[arg(long)]
    stats: bool,

    /// Output a JSON report instead of human-readable lines.
    #[arg(long, env = "DOCCACHE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "DOCCACHE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "DOCCACHE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "DOCCACHE_QUIET")]
    quiet: bool,

    /// Files processed at once.
    #[arg(short, long, env = "DOCCACHE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Largest accepted input in bytes.
    #[arg(
        long,
        env = "DOCCACHE_MAX_INPUT_BYTES",
        default_value_t = doccache::config::DEFAULT_MAX_INPUT_BYTES
    )]
    max_input_bytes: usize,

    /// How long SQLite waits for another writer's lock, in milliseconds.
    #[arg(long, env = "DOCCACHE_SQLITE_BUSY_TIMEOUT", default_value_t = 5000)]
    sqlite_busy_timeout: u64,

    /// Converter timeout in seconds.
    #[arg(long, env = "DOCCACHE_CONVERTER_TIMEOUT", default_value_t = 120)]
    converter_timeout: u64,

    /// Store operation timeout in seconds.
    #[arg(long, env = "DOCCACHE_STORE_TIMEOUT", default_value_t = 10)]
    store_timeout: u64,

    /// Notifier timeout in seconds.
    #[arg(long, env = "DOCCACHE_NOTIFIER_TIMEOUT", default_value_t = 30)]
    notifier_timeout: u64,

    /// HTTP download timeout in seconds for URL inputs.
    #[arg(long, env = "DOCCACHE_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Let identical concurrent inputs convert independently.
    #[arg(long)]
    no_single_flight: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level logs unless --verbose is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.fingerprint_only;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Fingerprint-only mode ────────────────────────────────────────────
    if cli.fingerprint_only {
        return print_fingerprints(&cli).await;
    }

    let to_stdout =
        cli.output.is_none() && cli.deliver_to.is_none() && !cli.json && !cli.lookup_only;
    if to_stdout && cli.inputs.len() > 1 {
        anyhow::bail!("Several inputs need an output directory: pass -o <DIR>");
    }

    // ── Build service ────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress && !cli.lookup_only {
        let cb = CliProgressCallback::new();
        Some(cb as Arc<dyn ConversionProgressCallback>)
    } else {
        None
    };

    let config = build_config(&cli, progress_cb)?;
    let converter = build_converter(&cli)?;
    let notifier = build_notifier(&cli)?;
    let db_path = config.db_path.clone();

    let service = ConversionService::open(config, converter, notifier)
        .await
        .with_context(|| format!("Failed to open conversion store at {}", db_path.display()))?;

    // ── Stats ────────────────────────────────────────────────────────────
    if cli.stats {
        let records = service.record_count().await.context("Failed to read store")?;
        if cli.json {
            let stats = serde_json::json!({
                "db_path": db_path,
                "records": records,
                "pair": cli.pair.to_string(),
            });
            println!("{stats}");
        } else {
            println!("Database:  {}", db_path.display());
            println!("Pair:      {}", cli.pair);
            println!("Records:   {}", records);
        }
        if cli.inputs.is_empty() {
            return Ok(());
        }
    }

    // ── Load inputs ──────────────────────────────────────────────────────
    let destination = match &cli.deliver_to {
        Some(raw) => Some(service.destination(raw).context("Invalid --deliver-to")?),
        None => None,
    };

    let mut requests = Vec::with_capacity(cli.inputs.len());
    let mut load_failures = 0usize;
    for input in &cli.inputs {
        match load_request(&cli, input).await {
            Ok(mut req) => {
                if let Some(dest) = &destination {
                    req = req.with_destination(dest.clone());
                }
                requests.push(req);
            }
            Err(e) => {
                load_failures += 1;
                eprintln!("{} {}: {:#}", red("✗"), input, e);
            }
        }
    }

    // ── Lookup-only mode ─────────────────────────────────────────────────
    if cli.lookup_only {
        return print_lookups(&cli, &service, &requests, load_failures).await;
    }

    if let Some(dir) = &cli.output {
        check_output_collisions(dir, &requests)?;
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let items = service.process_all(requests).await;
    let failed = items.iter().filter(|i| i.result.is_err()).count() + load_failures;

    if let Some(dir) = &cli.output {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    }

    let mut json_items = Vec::with_capacity(items.len());
    for item in &items {
        let written = write_result(&cli, item).await?;
        if cli.json {
            json_items.push(item_json(item, written.as_deref()));
        } else if !cli.quiet && !show_progress {
            print_item(item, written.as_deref());
        }
    }

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json_items).context("Failed to serialise report")?
        );
    }

    if failed > 0 {
        anyhow::bail!("{} of {} inputs failed", failed, cli.inputs.len());
    }
    Ok(())
}

/// Map CLI args to `CacheConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<CacheConfig> {
    let mut builder = CacheConfig::builder()
        .formats(cli.pair)
        .max_input_bytes(cli.max_input_bytes)
        .converter_timeout_secs(cli.converter_timeout)
        .store_timeout_secs(cli.store_timeout)
        .sqlite_busy_timeout_ms(cli.sqlite_busy_timeout)
        .notifier_timeout_secs(cli.notifier_timeout)
        .concurrency(cli.concurrency)
        .single_flight(!cli.no_single_flight);

    if let Some(ref db) = cli.db {
        builder = builder.db_path(db);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn build_converter(cli: &Cli) -> Result<Arc<dyn Converter>> {
    if let Some(ref url) = cli.converter_url {
        let conv = HttpConverter::new(url, cli.converter_token.clone())
            .context("Invalid --converter-url")?;
        return Ok(Arc::new(conv));
    }
    Ok(Arc::new(CommandConverter::with_arg_template(
        cli.converter_cmd.clone(),
        &cli.converter_args,
    )))
}

fn build_notifier(cli: &Cli) -> Result<Option<Arc<dyn Notifier>>> {
    let notifier: Option<Arc<dyn Notifier>> = match (&cli.mail_endpoint, &cli.outbox) {
        (Some(endpoint), _) => Some(Arc::new(HttpNotifier::new(
            endpoint.clone(),
            cli.mail_from.clone(),
            cli.mail_token.clone(),
        ))),
        (None, Some(dir)) => Some(Arc::new(OutboxNotifier::new(dir))),
        (None, None) => None,
    };

    if cli.deliver_to.is_some() && notifier.is_none() {
        anyhow::bail!("--deliver-to needs --mail-endpoint or --outbox");
    }
    Ok(notifier)
}

/// Load one input and classify it.
async fn load_request(cli: &Cli, input: &str) -> Result<ConversionRequest> {
    let LoadedInput { bytes, file_name } = request::load_input(input, cli.download_timeout)
        .await
        .context("Failed to load input")?;

    let source = match cli.from {
        Some(f) => f,
        None => Format::from_file_name(&file_name).ok_or_else(|| {
            doccache::ConversionError::UnknownSourceFormat {
                name: file_name.clone(),
            }
        })?,
    };
    let target = cli.to.unwrap_or_else(|| target_for(cli.pair, source));

    Ok(ConversionRequest::new(bytes, source, target).with_file_name(file_name))
}

/// Refuse a batch in which two results would land on the same file in `dir`.
fn check_output_collisions(dir: &Path, requests: &[ConversionRequest]) -> Result<()> {
    let mut seen: HashMap<PathBuf, &str> = HashMap::new();
    for req in requests {
        let path = request::output_path(dir, req.label(), req.target);
        if let Some(first) = seen.insert(path.clone(), req.label()) {
            anyhow::bail!(
                "'{}' and '{}' would both be written to {}; convert them in separate runs",
                first,
                req.label(),
                path.display()
            );
        }
    }
    Ok(())
}

/// The other side of the pair; `pair.b` when `source` is not in it (the
/// coordinator then rejects the request with a clear message).
fn target_for(pair: FormatPair, source: Format) -> Format {
    pair.side_of(source)
        .map(|side| pair.format_of(side.other()))
        .unwrap_or(pair.b)
}

async fn print_fingerprints(cli: &Cli) -> Result<()> {
    let mut rows = Vec::new();
    for input in &cli.inputs {
        let digest = if request::is_url(input) {
            let loaded = request::load_input(input, cli.download_timeout).await?;
            fingerprint::digest(&loaded.bytes)
        } else {
            let path = PathBuf::from(input);
            tokio::task::spawn_blocking(move || fingerprint::digest_file(&path))
                .await
                .context("Fingerprint task failed")?
                .with_context(|| format!("Failed to read {input}"))?
        };
        rows.push((input.clone(), digest));
    }

    if cli.json {
        let json: Vec<_> = rows
            .iter()
            .map(|(input, d)| serde_json::json!({ "input": input, "digest": d }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        for (input, d) in rows {
            println!("{d}  {input}");
        }
    }
    Ok(())
}

async fn print_lookups(
    cli: &Cli,
    service: &ConversionService,
    requests: &[ConversionRequest],
    load_failures: usize,
) -> Result<()> {
    let mut failed = load_failures;
    let mut json_items = Vec::new();

    for req in requests {
        match service.coordinator().lookup_only(req).await {
            Ok(hit) => {
                if cli.json {
                    json_items.push(serde_json::json!({
                        "label": req.label(),
                        "hit": hit.is_some(),
                        "outcome": hit,
                    }));
                } else if let Some(outcome) = hit {
                    println!(
                        "{} {}  hit  → {} ({} bytes)",
                        green("✓"),
                        req.label(),
                        outcome.format,
                        outcome.size()
                    );
                } else {
                    println!("{} {}  miss", dim("·"), req.label());
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{} {}: {}", red("✗"), req.label(), e);
            }
        }
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    }
    if failed > 0 {
        anyhow::bail!("{} of {} lookups failed", failed, cli.inputs.len());
    }
    Ok(())
}

/// Write an item's result bytes (stdout or `-o` dir). Results salvaged from
/// a failed cache write or a failed delivery are written too.
async fn write_result(cli: &Cli, item: &BatchItem) -> Result<Option<PathBuf>> {
    let (bytes, format) = match &item.result {
        Ok(report) => (report.outcome.bytes.clone(), report.outcome.format),
        Err(e) => match (e.output_bytes(), salvaged_format(e)) {
            (Some(b), Some(f)) => (b, f),
            _ => return Ok(None),
        },
    };

    if let Some(dir) = &cli.output {
        let path = request::output_path(dir, &item.label, format);
        write_atomic(&path, &bytes).await?;
        return Ok(Some(path));
    }

    if cli.deliver_to.is_none() && !cli.json {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(&bytes)
            .context("Failed to write to stdout")?;
        handle.flush().ok();
    }
    Ok(None)
}

fn salvaged_format(e: &PipelineError) -> Option<Format> {
    match e {
        PipelineError::Conversion(c) => c.salvaged_output().map(|o| o.format),
        PipelineError::Delivery { outcome, .. } => Some(outcome.format),
    }
}

/// Write via temp file + rename so a reader never sees a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to move result into {}", path.display()))?;
    Ok(())
}

fn print_item(item: &BatchItem, written: Option<&Path>) {
    let target = written
        .map(|p| format!("  →  {}", bold(&p.display().to_string())))
        .unwrap_or_default();
    match &item.result {
        Ok(report) => {
            let origin = match report.outcome.origin {
                Origin::CacheHit => cyan("cache hit"),
                Origin::Converted => "converted".to_string(),
            };
            eprintln!(
                "{} {}  {}  {} bytes  {}ms{}",
                green("✔"),
                item.label,
                origin,
                report.outcome.size(),
                report.outcome.timings.total_ms,
                target
            );
        }
        Err(e) => eprintln!("{} {}: {}{}", red("✘"), item.label, e, target),
    }
}

fn item_json(item: &BatchItem, written: Option<&Path>) -> serde_json::Value {
    match &item.result {
        Ok(report) => serde_json::json!({
            "label": item.label,
            "ok": true,
            "report": report,
            "written_to": written,
        }),
        Err(e) => serde_json::json!({
            "label": item.label,
            "ok": false,
            "error": e.to_string(),
            "stage": match e {
                PipelineError::Conversion(c) => c.stage(),
                PipelineError::Delivery { .. } => None,
            },
            "written_to": written,
        }),
    }
}
