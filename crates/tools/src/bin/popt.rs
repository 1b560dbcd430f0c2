use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{command, Arg};
use poff::opt::Optimizer;
use poff::read::PoffFile;

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        eprintln!("popt: {:#}", error);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = command!()
        .max_term_width(100)
        .args(&[Arg::new("file")
            .required(true)
            .value_parser(clap::value_parser!(PathBuf))
            .help("The executable to optimize in place")])
        .get_matches();

    let path = matches.get_one::<PathBuf>("file").unwrap();
    let data = fs::read(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let file = PoffFile::parse(&*data)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    let before = file.program().len();

    let object = Optimizer::new()
        .optimize(&file)
        .with_context(|| format!("failed to optimize '{}'", path.display()))?;
    let after = object.program().len();
    log::info!(
        "{}: {} program bytes -> {}",
        path.display(),
        before,
        after
    );

    let bytes = object.write_vec().context("failed to serialize output")?;
    fs::write(path, bytes)
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    Ok(())
}
