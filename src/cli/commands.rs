use std::fmt::Write as _;
use std::fs;
use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Args;
use crossbeam_channel::{select, unbounded, Receiver};
use serde_json::Value;
use unicode_width::UnicodeWidthChar;

use crate::engine::{Engine, Request, Response};
use crate::history::Entry;
use crate::intake::IntakeEvent;

const DEFAULT_COLUMNS: usize = 80;
const WATCH_IDLE: Duration = Duration::from_millis(250);

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Text to add. If omitted, reads from stdin.
    #[arg()]
    pub text: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Query terms; every term must appear in a match
    #[arg()]
    pub query: Vec<String>,
    /// Limit the number of results printed
    #[arg(long)]
    pub limit: Option<usize>,
    /// Print matches as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Entry identifier, as shown by `list`
    pub id: String,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Write to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// JSON file holding a list of entries or an export bundle
    pub file: PathBuf,
}

pub fn add(engine: &Engine, args: AddArgs) -> Result<()> {
    let text = match args.text {
        Some(text) => text,
        None => match read_stdin()? {
            Some(text) => text,
            None => bail!("no text given and stdin is a terminal"),
        },
    };
    if engine.store().add(&text) {
        println!("Added to history ({} entries)", engine.store().len());
    } else {
        println!("Skipped: text is empty or shorter than the minimum length");
    }
    Ok(())
}

pub fn list(engine: &Engine, args: ListArgs) -> Result<()> {
    let history = engine.history();
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&*history).context("serialising history")?
        );
        return Ok(());
    }
    print!("{}", format_entries(&history, terminal_columns()));
    Ok(())
}

pub fn search(engine: &Engine, args: SearchArgs) -> Result<()> {
    let matches = run_search(engine, &args);
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&matches).context("serialising matches")?
        );
        return Ok(());
    }
    print!("{}", format_entries(&matches, terminal_columns()));
    Ok(())
}

fn run_search(engine: &Engine, args: &SearchArgs) -> Vec<Entry> {
    let query = args.query.join(" ");
    let mut matches = engine.search(&query);
    if let Some(limit) = args.limit {
        matches.truncate(limit);
    }
    matches
}

pub fn delete(engine: &Engine, args: DeleteArgs) -> Result<()> {
    if !engine.store().delete_by_id(&args.id) {
        bail!("no history entry with id {}", args.id);
    }
    println!("Deleted entry {}", args.id);
    Ok(())
}

pub fn clear(engine: &Engine) -> Result<()> {
    let removed = engine.store().len();
    engine.store().clear();
    println!("Cleared {removed} entries");
    Ok(())
}

pub fn toggle(engine: &Engine) -> Result<()> {
    let enabled = engine.toggle_detection();
    println!(
        "Copy detection {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

pub fn stats(engine: &Engine) -> Result<()> {
    print!(
        "{}",
        format_stats(
            &engine.history(),
            engine.detection_enabled(),
            engine.persistence_failures()
        )
    );
    Ok(())
}

fn format_stats(history: &[Entry], detection_enabled: bool, failed_writes: usize) -> String {
    let compressed = history.iter().filter(|e| e.compressed).count();
    let original: usize = history.iter().map(|e| e.text.len()).sum();
    let stored: usize = history.iter().map(|e| e.size).sum();
    let mut out = String::new();
    let _ = writeln!(&mut out, "entries     {}", history.len());
    let _ = writeln!(&mut out, "compressed  {compressed}");
    let _ = writeln!(&mut out, "text bytes  {original}");
    let _ = writeln!(&mut out, "stored      {stored}");
    if original > 0 {
        let _ = writeln!(
            &mut out,
            "ratio       {:.1}%",
            stored as f64 * 100.0 / original as f64
        );
    }
    let _ = writeln!(
        &mut out,
        "detection   {}",
        if detection_enabled { "on" } else { "off" }
    );
    if failed_writes > 0 {
        let _ = writeln!(&mut out, "failed      {failed_writes} writes");
    }
    out
}

pub fn export(engine: &Engine, args: ExportArgs) -> Result<()> {
    let bundle = engine.export();
    let json = serde_json::to_string_pretty(&bundle).context("serialising export")?;
    match args.output {
        Some(path) => {
            fs::write(&path, json)
                .with_context(|| format!("writing export {}", path.display()))?;
            eprintln!("Exported {} entries to {}", bundle.count, path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

pub fn import(engine: &Engine, args: ImportArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("reading import {}", args.file.display()))?;
    let data: Value = serde_json::from_str(&raw)
        .with_context(|| format!("parsing import {}", args.file.display()))?;
    match engine.handle(Request::Import {
        data: import_items(data),
    }) {
        Response::Imported { count, .. } => {
            println!("Imported {count} entries");
            Ok(())
        }
        Response::Failure { error, .. } => bail!(error),
        other => bail!("unexpected import response: {}", other.to_json()),
    }
}

/// Accepts both a bare list of entries and a file written by `export`.
fn import_items(data: Value) -> Value {
    match data {
        Value::Object(mut bundle) if bundle.contains_key("items") => {
            bundle.remove("items").unwrap_or(Value::Null)
        }
        other => other,
    }
}

pub fn watch(engine: &Engine) -> Result<()> {
    let lines = spawn_stdin_lines()?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    watch_lines(engine, &lines, &mut out)
}

fn watch_lines(engine: &Engine, lines: &Receiver<String>, out: &mut impl Write) -> Result<()> {
    loop {
        let timeout = engine
            .next_deadline()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .unwrap_or(WATCH_IDLE);
        select! {
            recv(lines) -> line => match line {
                Ok(line) => {
                    engine.on_candidate(&line);
                }
                Err(_) => {
                    if let Some(event) = engine.flush_intake() {
                        report_intake(out, &event)?;
                    }
                    return Ok(());
                }
            },
            default(timeout) => {
                if let Some(event) = engine.tick() {
                    report_intake(out, &event)?;
                }
            }
        }
    }
}

fn report_intake(out: &mut impl Write, event: &IntakeEvent) -> Result<()> {
    match event {
        IntakeEvent::Forwarded { text, added } => writeln!(
            out,
            "{} {}",
            if *added { "added  " } else { "skipped" },
            fit_width(text, DEFAULT_COLUMNS - 8)
        )?,
        IntakeEvent::Dropped { text } => {
            writeln!(out, "dropped {}", fit_width(text, DEFAULT_COLUMNS - 8))?
        }
    }
    out.flush()?;
    Ok(())
}

pub fn serve(engine: &Engine) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve_lines(engine, stdin.lock(), &mut stdout.lock())
}

fn serve_lines(engine: &Engine, input: impl BufRead, out: &mut impl Write) -> Result<()> {
    for line in input.lines() {
        let line = line.context("reading request")?;
        let request = line.trim();
        if request.is_empty() {
            continue;
        }
        let response = engine.handle_json(request);
        writeln!(out, "{}", response.to_json()).context("writing response")?;
        out.flush()?;
    }
    Ok(())
}

fn spawn_stdin_lines() -> Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("copyboard-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(?err, "stopped reading stdin");
                        break;
                    }
                }
            }
        })
        .context("spawning stdin reader")?;
    Ok(rx)
}

fn read_stdin() -> Result<Option<String>> {
    if atty::is(atty::Stream::Stdin) {
        return Ok(None);
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(Some(buf))
}

fn terminal_columns() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .filter(|cols: &usize| *cols >= 40)
        .unwrap_or(DEFAULT_COLUMNS)
}

fn format_entries(entries: &[Entry], columns: usize) -> String {
    if entries.is_empty() {
        return "History is empty.\n".to_string();
    }
    let mut out = String::new();
    for entry in entries {
        let mut headline = format!("{}  {}", entry.id, entry.display_date);
        if entry.compressed {
            headline.push_str("  [compressed]");
        }
        let _ = writeln!(&mut out, "{headline}");
        let _ = writeln!(&mut out, "    {}", fit_width(&entry.text, columns - 4));
    }
    out
}

/// Cuts `text` to at most `max_cols` terminal columns, marking the cut
/// with an ellipsis.
fn fit_width(text: &str, max_cols: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    let budget = max_cols.saturating_sub(1);
    for ch in text.chars() {
        let width = ch.width().unwrap_or(0);
        if used + width > budget {
            let rest: usize = text[out.len()..]
                .chars()
                .map(|c| c.width().unwrap_or(0))
                .sum();
            if used + rest <= max_cols {
                out.push_str(&text[out.len()..]);
            } else {
                out.push('…');
            }
            return out;
        }
        out.push(ch);
        used += width;
    }
    out
}
