use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{command, Arg, ArgAction};
use poff::read::PoffFile;
use poff_tools::{dump, map_file};

fn main() {
    env_logger::init();
    if let Err(error) = run() {
        eprintln!("pdump: {:#}", error);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let matches = command!()
        .max_term_width(100)
        .args(&[
            Arg::new("file")
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("The object or executable to inspect"),
            Arg::new("disassemble")
                .short('d')
                .long("disassemble")
                .action(ArgAction::SetTrue)
                .help("Disassemble the program section"),
            Arg::new("symbols")
                .short('s')
                .long("symbols")
                .action(ArgAction::SetTrue)
                .help("Print the symbol table"),
            Arg::new("relocs")
                .short('r')
                .long("relocs")
                .action(ArgAction::SetTrue)
                .help("Print the relocation table"),
            Arg::new("lines")
                .short('l')
                .long("lines")
                .action(ArgAction::SetTrue)
                .help("Print line numbers and source file names"),
        ])
        .get_matches();

    let path = matches.get_one::<PathBuf>("file").unwrap();
    let data = map_file(path)?;
    let file = PoffFile::parse(&*data)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;

    let stdout = io::stdout();
    let mut w = stdout.lock();
    let everything = !matches.get_flag("disassemble")
        && !matches.get_flag("symbols")
        && !matches.get_flag("relocs")
        && !matches.get_flag("lines");

    dump::print_header(&mut w, &file)?;
    if everything || matches.get_flag("symbols") {
        dump::print_symbols(&mut w, &file)?;
    }
    if everything || matches.get_flag("relocs") {
        dump::print_relocations(&mut w, &file)?;
    }
    if everything || matches.get_flag("lines") {
        dump::print_line_numbers(&mut w, &file)?;
    }
    if everything || matches.get_flag("disassemble") {
        dump::print_disassembly(&mut w, &file)?;
    }
    Ok(())
}
