// bbridge: inspect BalanceBridge pairing codes and the effective client configuration.

use anyhow::{bail, Context};
use bridge_client::{config, logging};
use bridge_core::{parse_pairing_code, PROTOCOL_VERSION};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: bbridge [--version] <command>

commands:
  pair <code | @file>   validate a pairing code and print its summary
  config                print the effective configuration";

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    for arg in &args {
        if arg == "--version" || arg == "-V" {
            println!("bbridge {} (protocol v{})", VERSION, PROTOCOL_VERSION);
            return Ok(());
        }
    }

    let cfg = config::load().context("loading configuration")?;
    if let Err(e) = logging::init_logging(&cfg.log) {
        eprintln!("bbridge: logging disabled: {e}");
    }

    match args.first().map(String::as_str) {
        Some("pair") => {
            let Some(input) = args.get(1) else {
                bail!("pair needs a code or @file\n\n{USAGE}");
            };
            pair(input)
        }
        Some("config") => {
            let text = toml::to_string_pretty(&cfg).context("rendering configuration")?;
            print!("{text}");
            Ok(())
        }
        Some(other) => bail!("unknown command {other:?}\n\n{USAGE}"),
        None => {
            println!("{USAGE}");
            Ok(())
        }
    }
}

fn pair(input: &str) -> anyhow::Result<()> {
    let code = match input.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading pairing code from {path}"))?,
        None => input.to_string(),
    };
    let descriptor = parse_pairing_code(&code).context("pairing code rejected")?;
    let server = descriptor.validate().context("pairing code rejected")?;
    tracing::debug!(server = %server.fingerprint(), relays = descriptor.relays.len(), "pairing code accepted");

    println!("app:     {}", descriptor.app_id);
    println!("version: {}", descriptor.version);
    println!("server:  {} ({})", server.fingerprint(), server.to_hex());
    println!("relays:");
    for relay in &descriptor.relays {
        println!("  {relay}");
    }
    Ok(())
}
