#![allow(clippy::print_stderr)]

#[macro_use]
extern crate tracing;

mod service;

use std::process::exit;

use anyhow::Context as _;
use histwire_proxy::config::{Conf, ConfInput};
use seahorse::{App, Context, Flag, FlagType};

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!("{} [flags]", env!("CARGO_PKG_NAME")))
        .action(run_action)
        .flag(Flag::new("socket-path", FlagType::String).description("Local socket path (default: $XDG_RUNTIME_DIR/histwire.sock)"))
        .flag(Flag::new("ingest-host", FlagType::String).description("Log-ingestion service host (required)"))
        .flag(Flag::new("ingest-port", FlagType::Int).description("Log-ingestion service port (default: 5170)"))
        .flag(Flag::new("search-host", FlagType::String).description("Search service host (required)"))
        .flag(Flag::new("search-port", FlagType::Int).description("Search service port (default: 9200)"))
        .flag(Flag::new("pool-size", FlagType::Int).description("Idle connections kept per downstream target (default: 4)"))
        .flag(Flag::new("ca-file", FlagType::String).description("CA bundle PEM file (required)"))
        .flag(Flag::new("cert-file", FlagType::String).description("Client certificate PEM file (required)"))
        .flag(Flag::new("key-file", FlagType::String).description("Client private key PEM file (required)"))
        .flag(Flag::new("search-ca-file", FlagType::String).description("Distinct CA bundle for the search service"))
        .flag(Flag::new("search-cert-file", FlagType::String).description("Distinct client certificate for the search service"))
        .flag(Flag::new("search-key-file", FlagType::String).description("Distinct client key for the search service"))
        .flag(Flag::new("debug", FlagType::Bool).description("Enable debug logging"));

    app.run(std::env::args().collect());
}

fn run_action(c: &Context) {
    let result = parse_conf(c).and_then(|conf| {
        setup_logger(conf.debug);
        histwire_tls::install_default_crypto_provider();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build the async runtime")?;

        runtime.block_on(service::run(conf))
    });

    match result {
        Ok(()) => exit(0),
        Err(error) => {
            // The logger may not be set up yet when configuration
            // parsing fails; make sure the operator sees something.
            eprintln!("{error:#}");
            error!(error = format!("{error:#}"), "Fatal");
            exit(1);
        }
    }
}

fn parse_conf(c: &Context) -> anyhow::Result<Conf> {
    let input = ConfInput {
        socket_path: c.string_flag("socket-path").ok(),
        ingest_host: c.string_flag("ingest-host").ok(),
        ingest_port: int_flag_u16(c, "ingest-port")?,
        search_host: c.string_flag("search-host").ok(),
        search_port: int_flag_u16(c, "search-port")?,
        pool_capacity: match c.int_flag("pool-size") {
            Ok(n) => Some(usize::try_from(n).context("--pool-size must be positive")?),
            Err(_) => None,
        },
        ca_file: c.string_flag("ca-file").ok(),
        cert_file: c.string_flag("cert-file").ok(),
        key_file: c.string_flag("key-file").ok(),
        search_ca_file: c.string_flag("search-ca-file").ok(),
        search_cert_file: c.string_flag("search-cert-file").ok(),
        search_key_file: c.string_flag("search-key-file").ok(),
        debug: c.bool_flag("debug"),
    };

    Conf::from_input(input)
}

fn int_flag_u16(c: &Context, name: &str) -> anyhow::Result<Option<u16>> {
    match c.int_flag(name) {
        Ok(value) => u16::try_from(value)
            .with_context(|| format!("--{name} is out of range"))
            .map(Some),
        Err(_) => Ok(None),
    }
}

fn setup_logger(debug: bool) {
    use tracing::metadata::LevelFilter;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let default_level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("HISTWIRE_LOG")
        .from_env_lossy();

    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry().with(layer).with(env_filter).init();

    info!(version = env!("CARGO_PKG_VERSION"));
}
