use clap::{App, Arg};
use sgsh::fd::Fd;
use sgsh::logging::{self, error};
use std::path::PathBuf;
use std::process;
use writeval::chain::Mode;
use writeval::server::{Range, Store, StoreError};

fn fail(log: &logging::Logger, err: StoreError) -> ! {
    error!(log, "fatal error"; "error" => %err);
    process::exit(err.exit_code());
}

fn usage(log: &logging::Logger) -> ! {
    fail(
        log,
        StoreError::Usage(
            "Usage: sgsh-writeval [-l length | -t record_separator] [-b rbegin -e rend] socket_name"
                .to_owned(),
        ),
    );
}

pub fn main() {
    let log = logging::init();

    let matches = App::new("sgsh-writeval")
        .version("1.0")
        .about("Provides the most recent record of its input stream to Unix-socket clients.")
        .arg(
            Arg::with_name("length")
                .short("l")
                .takes_value(true)
                .help("Fixed record length"),
        )
        .arg(
            Arg::with_name("separator")
                .short("t")
                .takes_value(true)
                .empty_values(true)
                .help("Record separator byte (default newline)"),
        )
        .arg(
            Arg::with_name("rbegin")
                .short("b")
                .takes_value(true)
                .help("Start of the record range, counted back from the end (inclusive)"),
        )
        .arg(
            Arg::with_name("rend")
                .short("e")
                .takes_value(true)
                .help("End of the record range, counted back from the end (exclusive)"),
        )
        .arg(
            Arg::with_name("SOCKET")
                .help("Path of the Unix domain socket to serve")
                .required(true),
        )
        .get_matches();

    if matches.is_present("length") && matches.is_present("separator") {
        usage(&log);
    }

    let mode = if let Some(value) = matches.value_of("length") {
        match value.parse::<usize>() {
            Ok(length) if length > 0 => Mode::Length(length),
            _ => usage(&log),
        }
    } else if let Some(value) = matches.value_of("separator") {
        // A single byte; an empty argument selects NUL.
        let bytes = value.as_bytes();
        if bytes.len() > 1 {
            usage(&log);
        }
        Mode::Separator(bytes.first().copied().unwrap_or(0))
    } else {
        Mode::Separator(b'\n')
    };

    let mut range = Range::default();
    if let Some(value) = matches.value_of("rbegin") {
        range.rbegin = value.parse().unwrap_or_else(|_| usage(&log));
    }
    if let Some(value) = matches.value_of("rend") {
        range.rend = value.parse().unwrap_or_else(|_| usage(&log));
    }
    if range.rend <= range.rbegin {
        usage(&log);
    }

    let socket_path = PathBuf::from(matches.value_of("SOCKET").expect("SOCKET is required"));

    let mut store = match Store::new(Fd::stdin(), socket_path, mode, range, &log) {
        Ok(store) => store,
        Err(err) => fail(&log, err),
    };

    if let Err(err) = store.run() {
        fail(&log, err);
    }
}
