use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use age_model::{
    assemble, calibration_fingerprint, overlaps, set_interval, AgeModeler, CompositeSeries,
    DelegateConfig, HttpGenerativeClient, IntervalBound, LocalAgeModeler, Params, ProxyRecord,
    RemoteAgeModeler, Section, SpliceIntervals, TiePoint, TiePointSet,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum, ValueHint};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Sediment core age-model calibration and splice CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build or extend a core document from per-section CSV files
    Import(ImportArgs),
    /// Compute ages for every section from its tie-points
    Calibrate(CalibrateArgs),
    /// Assemble the age-ordered composite from calibrated sections
    Splice(SpliceArgs),
    /// Set or clear one bound of a section's splice window
    Interval(IntervalArgs),
}

#[derive(Parser, Debug)]
struct ImportArgs {
    /// Section CSV files (one section per file, named after the file stem)
    #[arg(required = true, value_hint = ValueHint::FilePath)]
    inputs: Vec<PathBuf>,

    /// Existing core document to merge into
    #[arg(long, value_hint = ValueHint::FilePath)]
    into: Option<PathBuf>,

    /// Output core document path (`-` for stdout)
    #[arg(short, long, default_value = "core.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Name of the depth column
    #[arg(long, default_value = "depth")]
    depth_column: String,

    /// Depths closer than this are treated as the same sample when merging
    #[arg(long, default_value_t = 0.0)]
    depth_tolerance: f64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct CalibrateArgs {
    /// Core document with sections and tie-points
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output document path (`-` for stdout)
    #[arg(short, long, default_value = "calibrated.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Decimal places kept on computed ages
    #[arg(long, default_value_t = 4)]
    age_decimals: u32,

    /// Keep ages at full floating precision
    #[arg(long, action = ArgAction::SetTrue)]
    full_precision: bool,

    /// Accept several tie-points at one depth (the first supplied wins)
    #[arg(long, action = ArgAction::SetTrue)]
    allow_duplicate_ties: bool,

    /// Delegate the age model to the generative service
    #[arg(long, action = ArgAction::SetTrue)]
    remote: bool,

    /// Generative service base URL
    #[arg(long, env = "AGE_MODEL_ENDPOINT")]
    endpoint: Option<String>,

    /// Generative model name
    #[arg(long, env = "AGE_MODEL_MODEL")]
    model: Option<String>,

    /// Generative service API key
    #[arg(long, env = "AGE_MODEL_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Request timeout for the generative service (seconds)
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Parser, Debug)]
struct SpliceArgs {
    /// Calibrated core document
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output path (`-` for stdout)
    #[arg(short, long, default_value = "composite.csv", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Override a window as SECTION:START:END (either bound may be empty)
    #[arg(long = "interval")]
    intervals: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct IntervalArgs {
    /// Core document to update
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Section id
    #[arg(long)]
    section: String,

    /// Which bound to set
    #[arg(long, value_enum)]
    field: BoundOpt,

    /// New value; an empty string clears the bound
    #[arg(long, allow_hyphen_values = true, default_value = "")]
    value: String,

    /// Output path (defaults to rewriting the input)
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BoundOpt {
    Start,
    End,
}

impl From<BoundOpt> for IntervalBound {
    fn from(value: BoundOpt) -> Self {
        match value {
            BoundOpt::Start => IntervalBound::Start,
            BoundOpt::End => IntervalBound::End,
        }
    }
}

/// Everything known about one core, as exchanged with the record store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CoreDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    core: Option<JsonValue>,
    #[serde(default)]
    sections: Vec<Section>,
    #[serde(default)]
    tie_points: Vec<TiePoint>,
    #[serde(default)]
    intervals: SpliceIntervals,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    calibrated_sections: Option<Vec<Section>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    calibration: Option<CalibrationInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalibrationInfo {
    generated_at: DateTime<Utc>,
    modeler: String,
    fingerprint: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = match &cli.command {
        Command::Import(args) => args.verbose,
        Command::Calibrate(args) => args.verbose,
        Command::Splice(args) => args.verbose,
        Command::Interval(args) => args.verbose,
    };
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    match cli.command {
        Command::Import(args) => handle_import(args),
        Command::Calibrate(args) => handle_calibrate(args),
        Command::Splice(args) => handle_splice(args),
        Command::Interval(args) => handle_interval(args),
    }
}

fn handle_import(args: ImportArgs) -> Result<()> {
    if !args.depth_tolerance.is_finite() || args.depth_tolerance < 0.0 {
        return Err(anyhow!("--depth-tolerance must be a non-negative number"));
    }
    let mut doc = match args.into.as_ref() {
        Some(path) => read_document(path)?,
        None => CoreDocument::default(),
    };

    let parsed: Vec<Section> = args
        .inputs
        .par_iter()
        .map(|path| read_section_csv(path, &args.depth_column))
        .collect::<Result<Vec<_>>>()?;

    for incoming in parsed {
        match doc.sections.iter_mut().find(|s| s.id == incoming.id) {
            Some(existing) => {
                let summary = existing
                    .merge_records(incoming.data_points, args.depth_tolerance)
                    .with_context(|| format!("failed to merge section {}", incoming.id))?;
                info!(
                    "Section {}: merged {} records, inserted {}",
                    existing.id, summary.merged, summary.inserted
                );
            }
            None => {
                info!(
                    "Section {}: new, {} records",
                    incoming.id,
                    incoming.data_points.len()
                );
                doc.sections.push(incoming);
            }
        }
    }
    // Raw data changed, so any earlier calibration no longer describes it.
    if doc.calibrated_sections.take().is_some() {
        warn!("Dropped stale calibration; re-run `calibrate`");
        doc.calibration = None;
    }

    write_document(&doc, &args.output)?;
    Ok(())
}

fn read_section_csv(path: &Path, depth_column: &str) -> Result<Section> {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("cannot derive a section id from {}", path.display()))?
        .to_string();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .clone();
    let depth_idx = headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(depth_column))
        .ok_or_else(|| anyhow!("{} has no '{}' column", path.display(), depth_column))?;
    if headers.iter().any(|h| h.trim().eq_ignore_ascii_case("age")) {
        warn!("{}: ignoring 'age' column; ages come from calibration", path.display());
    }

    let mut records = Vec::new();
    let mut skipped_cells = 0usize;
    for (row_idx, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("{}: bad row {}", path.display(), row_idx + 2))?;
        let depth_text = row.get(depth_idx).unwrap_or("").trim();
        let mut record = if depth_text.is_empty() {
            ProxyRecord::new()
        } else {
            let depth: f64 = depth_text.parse().with_context(|| {
                format!(
                    "{}: row {}: invalid depth '{}'",
                    path.display(),
                    row_idx + 2,
                    depth_text
                )
            })?;
            if !depth.is_finite() {
                return Err(anyhow!(
                    "{}: row {}: depth '{}' is not a finite number",
                    path.display(),
                    row_idx + 2,
                    depth_text
                ));
            }
            ProxyRecord::at_depth(depth)
        };
        for (col_idx, (header, cell)) in headers.iter().zip(row.iter()).enumerate() {
            let key = header.trim();
            let cell = cell.trim();
            if col_idx == depth_idx || key.is_empty() || cell.is_empty() {
                continue;
            }
            if key.eq_ignore_ascii_case("age") {
                continue;
            }
            let stored = cell
                .parse::<f64>()
                .ok()
                .map(|value| record.insert_proxy(key, value).is_ok())
                .unwrap_or(false);
            if !stored {
                skipped_cells += 1;
            }
        }
        records.push(record);
    }
    if skipped_cells > 0 {
        warn!(
            "{}: skipped {} non-numeric cells",
            path.display(),
            skipped_cells
        );
    }
    debug!("{}: parsed {} records", path.display(), records.len());

    let mut section = Section::new(id.clone(), id, Vec::new());
    section
        .merge_records(records, 0.0)
        .with_context(|| format!("{}: invalid records", path.display()))?;
    Ok(section)
}

fn handle_calibrate(args: CalibrateArgs) -> Result<()> {
    let mut doc = read_document(&args.input)?;
    let params = Params {
        age_decimals: if args.full_precision {
            None
        } else {
            Some(args.age_decimals)
        },
        ..Params::default()
    };
    params.validate()?;

    let tie_set = TiePointSet::new(doc.tie_points.clone());
    if args.allow_duplicate_ties {
        if let Err(err) = tie_set.validate() {
            warn!("Tie-point check: {}", err);
        }
    } else {
        tie_set
            .validate()
            .context("tie-points rejected (use --allow-duplicate-ties to keep the first at each depth)")?;
    }
    let modeled = tie_set.section_ids_with_model();
    for section in &doc.sections {
        if !modeled.contains(&section.id) {
            warn!(
                "Section {} has fewer than two tie-points; its records stay undated",
                section.id
            );
        }
    }

    let modeler: Box<dyn AgeModeler> = if args.remote {
        let mut config = DelegateConfig {
            api_key: args.api_key.clone(),
            timeout_secs: args.timeout,
            ..DelegateConfig::default()
        };
        if let Some(endpoint) = args.endpoint.clone() {
            config.endpoint = endpoint;
        }
        if let Some(model) = args.model.clone() {
            config.model = model;
        }
        let client = HttpGenerativeClient::new(config)?;
        Box::new(RemoteAgeModeler::new(client, params.clone()))
    } else {
        Box::new(LocalAgeModeler::new(params.clone()))
    };

    let t_calibrate = Instant::now();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let calibrated = runtime
        .block_on(modeler.calibrate(&doc.sections, &doc.tie_points))
        .with_context(|| format!("{} calibration failed", modeler.name()))?;
    if args.profile || args.verbose {
        info!(
            "Calibrate stage: {:.1} ms ({} sections)",
            t_calibrate.elapsed().as_secs_f64() * 1000.0,
            calibrated.len()
        );
    }

    let aged: usize = calibrated
        .iter()
        .map(|s| s.data_points.iter().filter(|r| r.age().is_some()).count())
        .sum();
    info!(
        "Calibrated {} sections ({} dated records) with {} modeler",
        calibrated.len(),
        aged,
        modeler.name()
    );

    doc.calibration = Some(CalibrationInfo {
        generated_at: Utc::now(),
        modeler: modeler.name().to_string(),
        fingerprint: calibration_fingerprint(&doc.sections, &doc.tie_points, &params)?,
    });
    doc.calibrated_sections = Some(calibrated);
    write_document(&doc, &args.output)?;
    Ok(())
}

fn handle_splice(args: SpliceArgs) -> Result<()> {
    let mut doc = read_document(&args.input)?;
    for spec in &args.intervals {
        apply_interval_override(&mut doc.intervals, spec)?;
    }
    for overlap in overlaps(&doc.intervals) {
        warn!(
            "Splice windows of {} and {} overlap between ages {} and {}",
            overlap.first, overlap.second, overlap.from_age, overlap.to_age
        );
    }
    if doc.calibrated_sections.is_none() {
        warn!("{} has not been calibrated; composite is empty", args.input.display());
    }

    let composite = assemble(doc.calibrated_sections.as_deref(), &doc.intervals);
    match composite.age_span() {
        Some((from, to)) => info!(
            "Composite: {} records spanning ages {} to {}",
            composite.len(),
            from,
            to
        ),
        None => info!("Composite: no records"),
    }

    match args.format {
        OutputFormat::Csv => {
            if args.output.as_os_str() == "-" {
                let stdout = io::stdout();
                let mut writer = csv::Writer::from_writer(stdout.lock());
                write_composite_rows(&composite, &mut writer)?;
            } else {
                let file = File::create(&args.output)
                    .with_context(|| format!("failed to create {}", args.output.display()))?;
                let mut writer = csv::Writer::from_writer(file);
                write_composite_rows(&composite, &mut writer)?;
                info!("Wrote composite CSV: {}", args.output.display());
            }
        }
        OutputFormat::Json => write_json(&composite, &args.output)?,
    }
    Ok(())
}

/// Parses `SECTION:START:END`; the section id itself may contain colons.
fn apply_interval_override(intervals: &mut SpliceIntervals, spec: &str) -> Result<()> {
    let mut parts = spec.rsplitn(3, ':');
    let (Some(end), Some(start), Some(section)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(anyhow!("invalid --interval '{}': expected SECTION:START:END", spec));
    };
    if section.is_empty() {
        return Err(anyhow!("invalid --interval '{}': empty section id", spec));
    }
    set_interval(intervals, section, IntervalBound::Start, start)
        .with_context(|| format!("invalid --interval '{}'", spec))?;
    set_interval(intervals, section, IntervalBound::End, end)
        .with_context(|| format!("invalid --interval '{}'", spec))?;
    Ok(())
}

fn write_composite_rows<W: Write>(
    composite: &CompositeSeries,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    let proxy_keys = composite.proxy_keys();
    let mut header = vec!["age".to_string(), "depth".to_string(), "section".to_string()];
    header.extend(proxy_keys.iter().cloned());
    writer.write_record(&header)?;

    for point in &composite.points {
        let mut row = Vec::with_capacity(header.len());
        row.push(point.age.to_string());
        row.push(
            point
                .record
                .depth()
                .map(|d| d.to_string())
                .unwrap_or_default(),
        );
        row.push(point.section_id.clone());
        for key in &proxy_keys {
            row.push(
                point
                    .record
                    .proxy(key)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

fn handle_interval(args: IntervalArgs) -> Result<()> {
    let mut doc = read_document(&args.input)?;
    if !doc.sections.iter().any(|s| s.id == args.section) {
        warn!("Section {} is not in {}", args.section, args.input.display());
    }
    let updated = set_interval(&mut doc.intervals, &args.section, args.field.into(), &args.value)?;
    match updated.window() {
        Some((lo, hi)) => info!("Section {} window: {} to {}", args.section, lo, hi),
        None => info!("Section {} window not fully configured", args.section),
    }
    let output = args.output.as_ref().unwrap_or(&args.input);
    write_document(&doc, output)?;
    Ok(())
}

fn read_document(path: &Path) -> Result<CoreDocument> {
    let text =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not a valid core document", path.display()))
}

fn write_document(doc: &CoreDocument, path: &Path) -> Result<()> {
    write_json(doc, path)?;
    Ok(())
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle.write_all(text.as_bytes())?;
        handle.write_all(b"\n")?;
    } else {
        fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Wrote {}", path.display());
    }
    Ok(())
}
