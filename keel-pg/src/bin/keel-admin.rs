/// KEEL queue administration
///
/// Usage: keel-admin <setup|teardown|check|purge|attributes> [queue...]
///
/// Connection settings come from the KEEL_DB_* variables. Queue settings come
/// from the file named by KEEL_CONFIG, or the KEEL_* variables when unset.
/// Without queue names, `setup`, `teardown` and `check` act on the shared
/// envelope tables only.
use keel_core::KeelConfig;
use keel_pg::{telemetry, DbConfig, PostgresTransport};
use keel_storage::QueueAdmin;
use std::process::ExitCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Setup,
    Teardown,
    Check,
    Purge,
    Attributes,
}

impl Command {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "setup" => Some(Self::Setup),
            "teardown" => Some(Self::Teardown),
            "check" => Some(Self::Check),
            "purge" => Some(Self::Purge),
            "attributes" => Some(Self::Attributes),
            _ => None,
        }
    }
}

fn usage() -> ExitCode {
    eprintln!("Usage: keel-admin <setup|teardown|check|purge|attributes> [queue...]");
    ExitCode::from(2)
}

fn load_config() -> Result<KeelConfig, keel_core::ConfigError> {
    match std::env::var("KEEL_CONFIG") {
        Ok(path) => KeelConfig::load(path),
        Err(_) => {
            let config = KeelConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = telemetry::init_tracing(false);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().and_then(|a| Command::parse(a)) else {
        return usage();
    };
    let names = &args[1..];
    if names.is_empty() && matches!(command, Command::Purge | Command::Attributes) {
        return usage();
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let transport = match PostgresTransport::from_config(&DbConfig::from_env(), config.transport) {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("Failed to create transport: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&transport, command, names).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{:?} failed: {}", command, e);
            ExitCode::FAILURE
        }
    }
}

/// Returns false when `check` found drift.
async fn run(
    transport: &PostgresTransport,
    command: Command,
    names: &[String],
) -> Result<bool, keel_core::QueueError> {
    let mut healthy = true;

    match command {
        Command::Setup => transport.setup_envelope_tables().await?,
        Command::Teardown if names.is_empty() => transport.teardown_envelope_tables().await?,
        Command::Check => {
            let ok = transport.check_envelope_tables().await?;
            println!("envelope tables: {}", if ok { "ok" } else { "drift" });
            healthy &= ok;
        }
        _ => {}
    }

    for name in names {
        let queue = transport.queue(name)?;
        match command {
            Command::Setup => queue.setup().await?,
            Command::Teardown => queue.teardown().await?,
            Command::Check => {
                let ok = queue.check().await?;
                println!("{}: {}", name, if ok { "ok" } else { "drift" });
                healthy &= ok;
            }
            Command::Purge => queue.purge().await?,
            Command::Attributes => {
                let attributes = queue.attributes().await?;
                match serde_json::to_string(&attributes) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("{}: {}", name, e),
                }
            }
        }
    }

    Ok(healthy)
}
