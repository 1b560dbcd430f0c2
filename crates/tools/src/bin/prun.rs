use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{command, Arg};
use poff::read::PoffFile;
use poff::vm::{Config, Machine};
use poff_tools::map_file;

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(error) => {
            eprintln!("prun: {:#}", error);
            process::exit(2);
        }
    }
}

fn run() -> Result<i32> {
    let matches = command!()
        .max_term_width(100)
        .args(&[
            Arg::new("file")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("The executable to run"),
            Arg::new("strsize")
                .long("strsize")
                .value_parser(clap::value_parser!(u16))
                .default_value("1024")
                .help("String stack size in bytes"),
            Arg::new("stksize")
                .long("stksize")
                .value_parser(clap::value_parser!(u16))
                .default_value("4096")
                .help("Frame stack size in bytes"),
            Arg::new("hpsize")
                .long("hpsize")
                .value_parser(clap::value_parser!(u16))
                .default_value("4096")
                .help("Heap size in bytes"),
            Arg::new("stralloc")
                .long("stralloc")
                .value_parser(clap::value_parser!(u16))
                .default_value("80")
                .help("Allocation size for standard strings"),
        ])
        .get_matches();

    let path = matches.get_one::<PathBuf>("file").unwrap();
    let config = Config {
        strsize: *matches.get_one::<u16>("strsize").unwrap(),
        stksize: *matches.get_one::<u16>("stksize").unwrap(),
        hpsize: *matches.get_one::<u16>("hpsize").unwrap(),
        stralloc: *matches.get_one::<u16>("stralloc").unwrap(),
        ..Config::default()
    };

    let data = map_file(path)?;
    let file = PoffFile::parse(&*data)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    let mut machine = Machine::load(&file, config)
        .with_context(|| format!("failed to load '{}'", path.display()))?;

    match machine.run() {
        Ok(code) => {
            machine.release();
            log::info!("program exited with code {}", code);
            Ok(i32::from(code))
        }
        Err(info) => {
            machine.release();
            eprintln!("prun: {}", info);
            Ok(i32::from(info.trap.code()))
        }
    }
}
