#![allow(clippy::print_stderr)]

#[macro_use]
extern crate tracing;

use std::process::exit;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use histwire_hook::{FallbackTarget, HookArgs};
use histwire_tls::TlsFiles;
use seahorse::{App, Context, Flag, FlagType};

const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_INGEST_PORT: u16 = 5170;

fn main() {
    let app = App::new(env!("CARGO_PKG_NAME"))
        .description(env!("CARGO_PKG_DESCRIPTION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .usage(format!(
            "{} --command <cmd> --return-code <rc> --pwd <dir> [flags]",
            env!("CARGO_PKG_NAME"),
        ))
        .action(run_action)
        .flag(Flag::new("command", FlagType::String).description("The command line that just ran (required)"))
        .flag(Flag::new("return-code", FlagType::Int).description("Exit status of the command (default: 0)"))
        .flag(Flag::new("pwd", FlagType::String).description("Working directory captured before the command ran (required)"))
        .flag(Flag::new("start-ts", FlagType::String).description("Start timestamp: RFC 3339 or epoch seconds with fraction"))
        .flag(Flag::new("socket-path", FlagType::String).description("Proxy socket path (default: $XDG_RUNTIME_DIR/histwire.sock)"))
        .flag(Flag::new("timeout", FlagType::String).description("Socket delivery budget, e.g. 500ms or 3s (default: 3s)"))
        .flag(Flag::new("ingest-host", FlagType::String).description("Log-ingestion host for the direct fallback path"))
        .flag(Flag::new("ingest-port", FlagType::Int).description("Log-ingestion port (default: 5170)"))
        .flag(Flag::new("ca-file", FlagType::String).description("CA bundle PEM for the fallback path"))
        .flag(Flag::new("cert-file", FlagType::String).description("Client certificate PEM for the fallback path"))
        .flag(Flag::new("key-file", FlagType::String).description("Client private key PEM for the fallback path"))
        .flag(Flag::new("env-policy", FlagType::String).description("Environment filter policy file (JSON)"))
        .flag(Flag::new("config-version", FlagType::String).description("Configuration version tag carried in the event"))
        .flag(Flag::new("ip-address", FlagType::String).description("IP address recorded in the event"))
        .flag(Flag::new("debug", FlagType::Bool).description("Emit delivery diagnostics to stderr"));

    app.run(std::env::args().collect());
}

/// The shell is waiting: whatever happens, exit 0 and stay quiet
/// unless diagnostics were asked for.
fn run_action(c: &Context) {
    let debug = c.bool_flag("debug");

    if debug {
        setup_logger();
    }

    histwire_tls::install_default_crypto_provider();

    let outcome = parse_args(c).and_then(|args| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build the async runtime")?;

        runtime.block_on(histwire_hook::run(args))
    });

    if let Err(error) = outcome {
        debug!(error = format!("{error:#}"), "Event was not delivered");
    }

    exit(0);
}

fn parse_args(c: &Context) -> anyhow::Result<HookArgs> {
    let command = c.string_flag("command").ok().context("--command is required")?;
    let pwd = c.string_flag("pwd").ok().context("--pwd is required")?;

    let socket_path = c
        .string_flag("socket-path")
        .ok()
        .map(Utf8PathBuf::from)
        .unwrap_or_else(default_socket_path);

    let socket_timeout = match c.string_flag("timeout").ok() {
        Some(repr) => humantime::parse_duration(&repr).context("invalid --timeout")?,
        None => DEFAULT_SOCKET_TIMEOUT,
    };

    let fallback = match c.string_flag("ingest-host").ok() {
        Some(host) => Some(FallbackTarget {
            host,
            port: match c.int_flag("ingest-port") {
                Ok(port) => u16::try_from(port).context("--ingest-port is out of range")?,
                Err(_) => DEFAULT_INGEST_PORT,
            },
            tls_files: TlsFiles {
                ca_file: c.string_flag("ca-file").ok().context("--ca-file is required with --ingest-host")?.into(),
                cert_file: c
                    .string_flag("cert-file")
                    .ok()
                    .context("--cert-file is required with --ingest-host")?
                    .into(),
                key_file: c
                    .string_flag("key-file")
                    .ok()
                    .context("--key-file is required with --ingest-host")?
                    .into(),
            },
        }),
        None => None,
    };

    Ok(HookArgs {
        socket_path,
        command,
        return_code: i64::try_from(c.int_flag("return-code").unwrap_or(0)).unwrap_or(i64::MAX),
        pwd,
        start_ts: c.string_flag("start-ts").ok(),
        ip_address: c.string_flag("ip-address").ok(),
        config_version: c.string_flag("config-version").ok(),
        env_policy_file: c.string_flag("env-policy").ok().map(Utf8PathBuf::from),
        socket_timeout,
        fallback,
    })
}

fn default_socket_path() -> Utf8PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| String::from("/tmp"));

    Utf8PathBuf::from(runtime_dir).join("histwire.sock")
}

fn setup_logger() {
    use tracing::metadata::LevelFilter;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .with_env_var("HISTWIRE_LOG")
        .from_env_lossy();

    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry().with(layer).with(env_filter).init();
}
