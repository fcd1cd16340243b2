//! The `uptane-agentd` binary: a thin CLI wrapper around [`uptane_agent::Device`],
//! parsing one TOML config path plus a couple of diagnostic flags with
//! `getopts`, then handing off to the device's own engine thread.

use std::env;
use std::io::Write;
use std::process;

use getopts::Options;
use log::{error, info};
use uptane_agent::config::Config;
use uptane_agent::device::Device;
use uptane_agent::error::Error;
use uptane_agent::events::{Event, FnSink, NullSink};

/// Exit codes per the CLI's documented contract: `0` success, `1`
/// configuration error, `2` provisioning failure, `3` network error, `4`
/// verification failure, `5` install failure.
macro_rules! exit {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {{
        eprintln!($fmt $(, $arg)*);
        process::exit($code);
    }}
}

fn main() {
    start_logging();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();
    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu then quit");
    opts.optflag("p", "print", "print the parsed config then quit");
    opts.optopt("c", "config", "path to the TOML config file", "PATH");

    let cli = match opts.parse(&args[1..]) {
        Ok(cli) => cli,
        Err(err) => exit!(1, "{}", err),
    };
    if cli.opt_present("help") {
        println!("{}", opts.usage(&format!("Usage: {} [options]", program)));
        process::exit(0);
    }

    let config_path = cli.opt_str("config").or_else(|| env::var("UPTANE_AGENT_CONFIG").ok()).unwrap_or_else(|| exit!(1, "no --config given and UPTANE_AGENT_CONFIG is unset"));
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => exit!(1, "couldn't load config {}: {}", config_path, err),
    };
    if cli.opt_present("print") {
        println!("{:#?}", config);
        process::exit(0);
    }

    let device = match Device::new(&config, Box::new(NullSink)) {
        Err(err @ Error::Storage(_)) => exit!(2, "provisioning failed: {}", err),
        Err(err) => exit!(1, "couldn't start device: {}", err),
        Ok(device) => device,
    };
    device.set_event_handler(Box::new(FnSink(|event: Event| match event {
        Event::Error(kind, detail) => error!("{}: {}", kind, detail),
        other => info!("{}", other),
    })));

    if let Err(err) = device.initialize() {
        exit_for(&err, "initialize failed");
    }

    if let Err(err) = device.run_forever(None) {
        exit_for(&err, "engine thread exited with an error");
    }
}

/// Maps a running failure onto the documented exit code table; used once
/// `initialize()` has already distinguished provisioning (code 2) from
/// plain configuration errors (code 1) itself.
fn exit_for(err: &Error, context: &str) -> ! {
    let code = match err {
        Error::Config(_) => 1,
        Error::Storage(_) => 2,
        Error::Network(_) | Error::UrlParse(_) => 3,
        Error::SecurityException(_)
        | Error::BadKeyId
        | Error::NonUniqueSignatures
        | Error::UnmetThreshold(_)
        | Error::IllegalThreshold(_)
        | Error::ExpiredMetadata
        | Error::TargetHashMismatch(_)
        | Error::OversizedTarget(_)
        | Error::MissMatchTarget(_)
        | Error::InvalidMetadata(_) => 4,
        Error::Pacman(_) => 5,
        _ => 1,
    };
    exit!(code, "{}: {}", context, err);
}

fn start_logging() {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| writeln!(buf, "{} {} - {}", buf.timestamp(), record.level(), record.args()));
    builder.init();
}
