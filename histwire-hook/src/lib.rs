//! Event construction and delivery for the shell hook.
//!
//! One invocation per interactive command. The hook must never delay
//! or abort the shell: every deadline is bounded, and the caller
//! swallows whatever error comes back.

#[macro_use]
extern crate tracing;

use std::io;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use histwire_event::{EnvPolicy, Event, EventParts, format_timestamp};
use histwire_tls::TlsFiles;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt as _;
use tokio::net::{TcpStream, UnixStream};

/// Budget for the whole fallback path: dial, handshake, write.
const DIRECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct HookArgs {
    pub socket_path: Utf8PathBuf,
    pub command: String,
    pub return_code: i64,
    /// Working directory captured before the command ran.
    pub pwd: String,
    /// RFC 3339 or `$EPOCHREALTIME`-style epoch seconds.
    pub start_ts: Option<String>,
    pub ip_address: Option<String>,
    pub config_version: Option<String>,
    pub env_policy_file: Option<Utf8PathBuf>,
    pub socket_timeout: Duration,
    pub fallback: Option<FallbackTarget>,
}

/// Direct mutual-TLS delivery to the log-ingestion service, used when
/// the proxy socket is unreachable.
#[derive(Debug)]
pub struct FallbackTarget {
    pub host: String,
    pub port: u16,
    pub tls_files: TlsFiles,
}

pub async fn run(args: HookArgs) -> anyhow::Result<()> {
    let event = build_event(&args).context("couldn't build the event")?;

    let line = event.encode_line();

    deliver(&args, &line).await
}

fn build_event(args: &HookArgs) -> anyhow::Result<Event> {
    let end = OffsetDateTime::now_utc();

    let start = args
        .start_ts
        .as_deref()
        .and_then(parse_start_timestamp)
        .unwrap_or(end);

    // A skewed clock must not produce an event that ends before it starts.
    let end = if end < start { start } else { end };

    let policy = match &args.env_policy_file {
        Some(path) => {
            let repr = std::fs::read_to_string(path).with_context(|| format!("couldn't read {path}"))?;
            EnvPolicy::from_json(&repr).with_context(|| format!("invalid environment policy in {path}"))?
        }
        None => EnvPolicy::permissive(),
    };

    let vars: Vec<(String, String)> = std::env::vars().collect();
    let env = policy.apply(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned());

    let builder = EventParts::builder()
        .command(args.command.clone())
        .return_code(args.return_code)
        .start_timestamp(format_timestamp(start))
        .end_timestamp(format_timestamp(end))
        .pwd(args.pwd.clone())
        .hostname(hostname)
        .env(env);

    let parts = match (&args.ip_address, &args.config_version) {
        (Some(ip_address), Some(config_version)) => builder
            .ip_address(ip_address.clone())
            .config_version(config_version.clone())
            .build(),
        (Some(ip_address), None) => builder.ip_address(ip_address.clone()).build(),
        (None, Some(config_version)) => builder.config_version(config_version.clone()).build(),
        (None, None) => builder.build(),
    };

    let event = Event::from_parts(parts);

    event.validate().map_err(|error| anyhow::anyhow!("{error}"))?;

    Ok(event)
}

/// Accepts RFC 3339 (`2025-01-01T00:00:00.123Z`) and epoch seconds
/// with an optional fraction (`1735689600.123456`, the shape of zsh's
/// `$EPOCHREALTIME`).
pub fn parse_start_timestamp(repr: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(repr, &Rfc3339) {
        return Some(parsed);
    }

    let (secs, frac) = repr.split_once('.').unwrap_or((repr, ""));

    let secs: i64 = secs.parse().ok()?;

    let nanos: i128 = if frac.is_empty() {
        0
    } else {
        let digits: String = frac.chars().take(9).collect();

        if !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let scale = 10i128.pow(9 - u32::try_from(digits.len()).ok()?);
        digits.parse::<i128>().ok()? * scale
    };

    OffsetDateTime::from_unix_timestamp_nanos(i128::from(secs) * 1_000_000_000 + nanos).ok()
}

async fn deliver(args: &HookArgs, line: &[u8]) -> anyhow::Result<()> {
    match tokio::time::timeout(args.socket_timeout, send_via_socket(&args.socket_path, line)).await {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(error)) => debug!(%error, "Socket delivery failed, trying the direct path"),
        Err(_elapsed) => debug!("Socket delivery timed out, trying the direct path"),
    }

    let Some(fallback) = &args.fallback else {
        anyhow::bail!("proxy socket unreachable and no fallback target configured");
    };

    tokio::time::timeout(DIRECT_TIMEOUT, send_direct(fallback, line))
        .await
        .context("direct delivery timed out")?
        .context("direct delivery failed")
}

async fn send_via_socket(path: &Utf8PathBuf, line: &[u8]) -> io::Result<()> {
    let mut stream = UnixStream::connect(path).await?;

    stream.write_all(line).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await?;
    stream.shutdown().await
}

async fn send_direct(fallback: &FallbackTarget, line: &[u8]) -> anyhow::Result<()> {
    let connector = histwire_tls::build_client_connector(&fallback.tls_files).context("fallback TLS material")?;

    let tcp = TcpStream::connect((fallback.host.as_str(), fallback.port))
        .await
        .context("couldn't reach the log-ingestion service")?;
    tcp.set_nodelay(true)?;

    let mut tls = histwire_tls::connect(&connector, &fallback.host, tcp)
        .await
        .context("TLS handshake with the log-ingestion service failed")?;

    tls.write_all(line).await?;
    tls.write_all(b"\n").await?;
    tls.flush().await?;
    tls.shutdown().await?;

    Ok(())
}
