extern crate dhw_engine;

use anyhow::Context;
use clap::Parser;
use dhw_engine::output::FileOutput;
use dhw_engine::run_project_from_state;
use dhw_engine::snapshot::{read_snapshot, write_snapshot};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Default, Debug)]
#[clap(author, version, about, long_about = None)]
struct DhwArgs {
    input_file: PathBuf,
    #[arg(long, help = "Directory for the results files (defaults to the input file's directory)")]
    output_dir: Option<PathBuf>,
    #[arg(long, short, default_value_t = false)]
    verbose: bool,
    #[arg(long, help = "Write the tank states at the end of the run to this path")]
    snapshot: Option<PathBuf>,
    #[arg(long, help = "Resume tank states from a snapshot written by an earlier run")]
    resume: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = DhwArgs::parse();

    let max_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let tracing_subscriber = tracing_subscriber::fmt::fmt()
        .with_max_level(max_level)
        .finish();
    tracing::subscriber::set_global_default(tracing_subscriber)
        .context("setting tracing subscriber failed")?;

    let input_file = args.input_file.as_path();
    let input_file_stem = input_file
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("input file name {input_file:?} is not usable"))?;
    let output_dir = match args.output_dir {
        Some(dir) => dir,
        None => input_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    fs::create_dir_all(&output_dir)?;
    // braces in the stem would otherwise be read as template placeholders
    let file_template = format!(
        "{}_{{}}.csv",
        input_file_stem.replace('{', "{{").replace('}', "}}")
    );
    let output = FileOutput::new(output_dir, file_template);

    let initial_state = args
        .resume
        .as_deref()
        .map(|path| -> anyhow::Result<_> {
            read_snapshot(File::open(path).with_context(|| format!("opening {path:?}"))?)
        })
        .transpose()?;

    let (results, final_state) = run_project_from_state(
        BufReader::new(File::open(input_file).with_context(|| format!("opening {input_file:?}"))?),
        &output,
        initial_state.as_ref(),
    )?;
    info!(
        "wrote {} columns for {} timesteps",
        results.columns.len(),
        results.timesteps.len()
    );

    if let Some(path) = args.snapshot {
        write_snapshot(&final_state, File::create(&path)?)?;
        info!("wrote final state to {path:?}");
    }

    Ok(())
}
