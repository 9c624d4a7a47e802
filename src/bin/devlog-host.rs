use devlog::config::Config;
use devlog::relay::{self, StartupError};
use devlog::session::FileSessionStore;
use std::env;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    // stdout carries the protocol; diagnostics go to stderr only.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("DEVLOG_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let config = Config::from_env();
    let store = FileSessionStore::new(config.session_state_path());

    if let Err(e) = relay::run_host(env::args().skip(1).collect(), &store) {
        eprintln!("Error: {}", e);
        if let StartupError::NoTarget(_) = e {
            eprint!("{}", relay::USAGE);
        }
        process::exit(1);
    }
}
