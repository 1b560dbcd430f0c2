use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{command, Arg, ArgAction};
use poff::link::{Error as LinkError, Linker};
use poff::read::PoffFile;
use poff::write::StreamingBuffer;
use poff_tools::map_file;

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(error) => {
            eprintln!("plink: {:#}", error);
            process::exit(2);
        }
    }
}

fn run() -> Result<i32> {
    let matches = command!()
        .max_term_width(100)
        .args(&[
            Arg::new("output")
                .short('o')
                .long("output")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("The output executable"),
            Arg::new("input")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .action(ArgAction::Append)
                .help("The input object files, one program and any number of units"),
        ])
        .get_matches();

    let output_path = matches.get_one::<PathBuf>("output").unwrap();
    let inputs: Vec<&PathBuf> = matches.get_many::<PathBuf>("input").unwrap().collect();

    let mut linker = Linker::new();
    for path in &inputs {
        let data = map_file(path)?;
        let file = PoffFile::parse(&*data)
            .with_context(|| format!("failed to parse '{}'", path.display()))?;
        log::debug!(
            "merging '{}' ({} program bytes)",
            path.display(),
            file.program().len()
        );
        linker
            .add_object(&file)
            .with_context(|| format!("failed to merge '{}'", path.display()))?;
    }

    let object = match linker.finish() {
        Ok(object) => object,
        Err(
            error @ (LinkError::UndefinedSymbol(_) | LinkError::MultiplyDefinedSymbol(_)),
        ) => {
            eprintln!("plink: {}", error);
            return Ok(1);
        }
        Err(error) => return Err(error.into()),
    };

    let out = fs::File::create(output_path)
        .with_context(|| format!("failed to create '{}'", output_path.display()))?;
    let mut buffer = StreamingBuffer::new(std::io::BufWriter::new(out));
    object
        .emit(&mut buffer)
        .with_context(|| format!("failed to write '{}'", output_path.display()))?;
    buffer.result()?;
    Ok(0)
}
