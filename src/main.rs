use clap::{Parser, Subcommand};
use devlog::config::Config;
use devlog::manifest::{EndSession, ManifestRouter, Registration, Vendor};
use devlog::session::{FileSessionStore, SessionController, SessionError, SessionStore};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Browser console logging for dev sessions")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register the native messaging host with your browsers
    Register {
        #[arg(long, help = "Register for Google Chrome")]
        chrome: bool,

        #[arg(long, help = "Register for Brave")]
        brave: bool,

        #[arg(long, help = "Register for Firefox and Firefox-based browsers")]
        firefox: bool,

        #[arg(long, help = "Extension ID (required for Chrome and Brave)", value_name = "ID")]
        extension_id: Option<String>,
    },
    /// Point browsers at this session's log file
    Start {
        #[arg(long, help = "Logging session name", value_name = "NAME")]
        session: String,

        #[arg(long, help = "Browser log file", value_name = "PATH")]
        log: PathBuf,

        #[arg(help = "Levels to capture (default: all)")]
        levels: Vec<String>,
    },
    /// Restore browsers to the stable host and drop the session
    Stop {
        #[arg(long, help = "Logging session name", value_name = "NAME")]
        session: String,
    },
    /// Show manifest registrations and the active session
    Status,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("DEVLOG_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();
    let router = ManifestRouter::from_config(&config);

    match args.command {
        Command::Register {
            chrome,
            brave,
            firefox,
            extension_id,
        } => handle_register(&config, &router, chrome, brave, firefox, extension_id.as_deref()),
        Command::Start {
            session,
            log,
            levels,
        } => {
            let controller = controller(&config, router)?;
            handle_start(&controller, &session, log, &levels)
        }
        Command::Stop { session } => {
            let controller = controller(&config, router)?;
            handle_stop(&controller, &session)
        }
        Command::Status => handle_status(&config, &router),
    }
}

fn controller(
    config: &Config,
    router: ManifestRouter,
) -> Result<SessionController<FileSessionStore>, Box<dyn std::error::Error>> {
    let host_binary = config.host_binary()?;
    Ok(SessionController::new(
        router,
        FileSessionStore::new(config.session_state_path()),
        config.wrappers_dir(),
        host_binary,
    ))
}

fn handle_register(
    config: &Config,
    router: &ManifestRouter,
    chrome: bool,
    brave: bool,
    firefox: bool,
    extension_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let host_path = config.host_binary()?;

    let mut vendors = Vec::new();
    if chrome {
        vendors.push(Vendor::Chrome);
    }
    if brave {
        vendors.push(Vendor::Brave);
    }
    if firefox {
        vendors.push(Vendor::Firefox);
    }
    // No explicit choice: Firefox, plus Chrome when an extension id was given.
    if vendors.is_empty() {
        if extension_id.is_some() {
            vendors.push(Vendor::Chrome);
        }
        vendors.push(Vendor::Firefox);
    }

    println!("devlog-host binary: {}", host_path.display());
    for vendor in vendors {
        println!("Registering for {}...", vendor);
        let written = router.register(vendor, &host_path, extension_id)?;
        println!("  Installed to:");
        for path in written {
            println!("    - {}", path.display());
        }
    }

    println!("✓ Registration complete");
    Ok(())
}

fn handle_start(
    controller: &SessionController<FileSessionStore>,
    session: &str,
    log: PathBuf,
    levels: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let started = controller.start(session, &log, levels)?;

    for failure in started.report.failures() {
        eprintln!("Warning: {}", failure);
    }

    println!("✓ Browser logging ready for session '{}'", session);
    println!("  log:     {}", started.state.log_path.display());
    if started.state.levels.is_empty() {
        println!("  levels:  all");
    } else {
        println!("  levels:  {}", started.state.levels.join(" "));
    }
    println!("  wrapper: {}", started.wrapper.display());
    Ok(())
}

fn handle_stop(
    controller: &SessionController<FileSessionStore>,
    session: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    match controller.stop(session)? {
        EndSession::Restored(report) => {
            for failure in report.failures() {
                eprintln!("Warning: {}", failure);
            }
            println!("✓ Browser logging stopped for session '{}'", session);
        }
        EndSession::NotOwner => {
            println!("✓ Session '{}' cleaned up (manifests belong to another session)", session);
        }
        EndSession::Unverified(reason) => {
            eprintln!("Warning: manifests left untouched: {}", reason);
        }
    }
    Ok(())
}

fn handle_status(config: &Config, router: &ManifestRouter) -> Result<(), Box<dyn std::error::Error>> {
    println!("Manifests:");
    for status in router.status() {
        let state = match status.registration {
            Registration::Missing => "not registered".to_string(),
            Registration::Registered { path } => path,
            Registration::Unreadable(reason) => format!("unreadable ({})", reason),
        };
        println!("  {:<8} {}", status.location.browser, state);
        println!("           {}", status.location.path.display());
    }

    let store = FileSessionStore::new(config.session_state_path());
    match store.load() {
        Ok(state) => {
            println!("Active session:");
            println!("  log:    {}", state.log_path.display());
            if state.levels.is_empty() {
                println!("  levels: all");
            } else {
                println!("  levels: {}", state.levels.join(" "));
            }
        }
        Err(SessionError::NoActiveSession(_)) => println!("Active session: none"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
