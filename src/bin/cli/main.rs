//! boardctl command line interface.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    SubCommand,
};
use console::style;
use log::{debug, trace, LevelFilter};
use simplelog::*;

use boardctl::{self as bc, BoardManager, UploadOptions, MAX_FIRMWARES};

mod commands;
mod keyboard;
mod select;

fn main() {
    println!("[BC] boardctl v{}", crate_version!());

    // The first Ctrl+C asks the running command to stop, the second one exits.
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            println!("🛑 received Ctrl+C!");
            process::exit(130);
        }
    })
    .expect("Failed to install my Ctrl-C handler!");

    let firmware_help = format!(
        "path to the firmware binaries; the first one built for the board \
         model is uploaded. Only the first {} files are considered.",
        MAX_FIRMWARES
    );
    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            boardctl finds the Caterina boards (Arduino Leonardo, Micro, \
            Esplora, Feather 32u4...) attached over USB and follows them \
            while they go back and forth between their application and \
            their bootloader.\n\
            \n\
            Uploading a firmware goes through the following steps: \n\
               \t* reboot the board into its bootloader (1200 bps touch) \n\
               \t* write the firmware and read it back \n\
               \t* start the new application and wait for it to show up \n\
            \n\
            When several boards are attached and none is selected with \
            `--board`, boardctl asks which one to use.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .setting(SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("BOARD")
                .help("the board to use")
                .long_help(
                    "the board to use, selected by serial number, tag \
                     (`<serial>-<model>`), USB location or device path.",
                )
                .long("--board")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .long_help("serial baud rate used to talk to the board application")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .global(true),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help(
                    "Sets the logging level of verbosity, repeat several times for \
                     higher verbosity",
                ),
        )
        .arg(
            Arg::with_name("q")
                .short("q")
                .global(true)
                .conflicts_with("v")
                .help("Only log errors"),
        )
        .subcommand(
            SubCommand::with_name("list")
                .about("list the attached boards")
                .arg(
                    Arg::with_name("WATCH")
                        .help("keep listing the boards as they come and go")
                        .short("-w")
                        .long("--watch"),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor").about("print what the board sends on its serial port"),
        )
        .subcommand(SubCommand::with_name("reset").about("start the board application"))
        .subcommand(SubCommand::with_name("reboot").about("reboot the board into its bootloader"))
        .subcommand(
            SubCommand::with_name("upload")
                .about("upload a firmware to the board")
                .arg(
                    Arg::with_name("WAIT")
                        .help("wait for the bootloader to be started by hand")
                        .long("--wait"),
                )
                .arg(
                    Arg::with_name("NOCHECK")
                        .help("upload the first firmware even if it targets another model")
                        .long("--nocheck"),
                )
                .arg(
                    Arg::with_name("NORESET")
                        .help("leave the board in its bootloader after the upload")
                        .long("--noreset"),
                )
                .arg(
                    Arg::with_name("FIRMWARE")
                        .help("path to the firmware binaries")
                        .long_help(firmware_help.as_str())
                        .required(true)
                        .multiple(true)
                        .index(1),
                ),
        )
        .get_matches();

    // Global arguments given after the subcommand only show up in its matches
    let global = matches.subcommand().1.unwrap_or(&matches);

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'boardctl -v -v -v' or 'boardctl -vvv' vs 'boardctl -v'
    let log_level = if matches.is_present("q") || global.is_present("q") {
        LevelFilter::Error
    } else {
        match matches.occurrences_of("v").max(global.occurrences_of("v")) {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    trace!("{:#?}", matches);

    let baud_rate = value_t!(global.value_of("BAUD_RATE"), u32).unwrap_or_else(|_| {
        println!(
            "{}: `{}` needs to be a numeric value",
            style("error").red(),
            style("baud-rate").cyan()
        );
        println!(
            "   {} `{}` is not a valid value",
            style("-->").cyan(),
            style(global.value_of("BAUD_RATE").unwrap()).on_red()
        );
        process::exit(-1);
    });

    let mut builder = bc::SettingsBuilder::default().serial_rate(baud_rate);
    if let Some(tag) = global.value_of("BOARD").or_else(|| matches.value_of("BOARD")) {
        builder = builder.board_tag(tag);
    }
    let settings = builder.finalize();

    let mut manager = BoardManager::with_serial_ports(settings.clone()).unwrap_or_else(|err| fail(err));
    if let Err(err) = manager.refresh() {
        fail(err);
    }

    if let ("list", Some(sub)) = matches.subcommand() {
        let result = commands::list(&mut manager, sub.is_present("WATCH"), &interrupted);
        finish(result);
    }

    let board = match select::select_board(&mut manager, settings.board_tag.as_deref(), &interrupted) {
        Some(board) => board,
        None => process::exit(1),
    };
    debug!("selected board: {:?}", board);
    let manager = manager.shared();

    let result = match matches.subcommand() {
        ("monitor", _) => commands::monitor(&manager, &board, &interrupted),
        ("reset", _) => commands::reset(&manager, &board, &interrupted),
        ("reboot", _) => commands::reboot(&manager, &board, &interrupted),
        ("upload", Some(sub)) => {
            let mut options = UploadOptions::default();
            if sub.is_present("WAIT") {
                options = options.wait_for_bootloader();
            }
            if sub.is_present("NOCHECK") {
                options = options.no_check();
            }
            if sub.is_present("NORESET") {
                options = options.no_reset();
            }
            let paths: Vec<&str> = sub.values_of("FIRMWARE").unwrap().collect();
            commands::upload_firmware(&manager, &board, &paths, options, &interrupted)
        }
        _ => unreachable!(),
    };
    finish(result);
}

fn finish(result: bc::Result<()>) -> ! {
    match result {
        Ok(()) => process::exit(0),
        Err(err) => fail(err),
    }
}

fn fail(err: bc::Error) -> ! {
    println!("{}: {}", style("error").red(), err);
    process::exit(match err.kind() {
        bc::ErrorKind::Cancelled => 130,
        _ => 1,
    });
}
