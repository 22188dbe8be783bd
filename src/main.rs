//! Train a saved model on raster patches and validate it periodically.

use std::path::PathBuf;

use rastertrain::config::{RunConfig, SourceCount};
use rastertrain::{ImageLoader, Orchestrator, SoftmaxPatchModel, logging};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

#[derive(Debug, Clone)]
struct CliOptions {
    config: PathBuf,
    nsources: Option<usize>,
    summary: Option<PathBuf>,
}

fn run() -> Result<(), String> {
    let Some(options) = parse_args(std::env::args().skip(1).collect())? else {
        println!("{}", help_text());
        return Ok(());
    };

    let run_name = options
        .config
        .file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string);
    if let Err(err) = logging::init(run_name.as_deref()) {
        eprintln!("File logging disabled: {err}");
        if let Err(err) = logging::init_stdout() {
            eprintln!("Logging disabled: {err}");
        }
    }

    let config = RunConfig::load(&options.config).map_err(|err| err.to_string())?;
    let count = SourceCount::resolve(options.nsources).map_err(|err| err.to_string())?;
    let loader = ImageLoader;
    let summary = Orchestrator::new(&config, count, &loader)
        .and_then(|orchestrator| orchestrator.run::<SoftmaxPatchModel>())
        .map_err(|err| {
            tracing::error!("Run aborted: {err}");
            err.to_string()
        })?;

    tracing::info!(
        "Completed {} epochs with {} validation passes",
        summary.epochs.len(),
        summary.validations.len()
    );
    if let Some(path) = &options.summary {
        summary.write_json(path).map_err(|err| err.to_string())?;
        tracing::info!("Run summary written to {}", path.display());
    }
    Ok(())
}

/// `None` when help was requested.
fn parse_args(args: Vec<String>) -> Result<Option<CliOptions>, String> {
    let mut config: Option<PathBuf> = None;
    let mut nsources: Option<usize> = None;
    let mut summary: Option<PathBuf> = None;

    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Ok(None),
            "--config" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--config requires a value".to_string())?;
                config = Some(PathBuf::from(value));
            }
            "--nsources" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--nsources requires a value".to_string())?;
                let count = value
                    .parse::<usize>()
                    .ok()
                    .filter(|count| *count >= 1)
                    .ok_or_else(|| format!("Invalid --nsources value: {value}"))?;
                nsources = Some(count);
            }
            "--summary" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--summary requires a value".to_string())?;
                summary = Some(PathBuf::from(value));
            }
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }

    let config = config.ok_or_else(|| format!("--config is required\n\n{}", help_text()))?;
    Ok(Some(CliOptions {
        config,
        nsources,
        summary,
    }))
}

fn help_text() -> String {
    [
        "rastertrain",
        "",
        "Train a saved model on raster patches, validating it every few epochs.",
        "",
        "Usage:",
        "  rastertrain --config <run.toml> [--nsources <n>] [--summary <path>]",
        "",
        "Options:",
        "  --config <path>    Run file describing the model, sources and schedule.",
        "  --nsources <n>     Number of sources; one extra source is always declared.",
        "                     Defaults to $RASTERTRAIN_NSOURCES, then 1.",
        "  --summary <path>   Write epoch and validation results as JSON.",
        "  -h, --help         Show this help.",
        "",
        "Logs go to stdout and to the logs folder under $RASTERTRAIN_HOME/.rastertrain.",
    ]
    .join("\n")
}
