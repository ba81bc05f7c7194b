//! Validated runtime configuration, built from process flags.

use anyhow::Context as _;
use camino::Utf8PathBuf;
use histwire_tls::TlsFiles;

pub const DEFAULT_SOCKET_FILENAME: &str = "histwire.sock";
pub const DEFAULT_INGEST_PORT: u16 = 5170;
pub const DEFAULT_SEARCH_PORT: u16 = 9200;
pub const DEFAULT_POOL_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct TargetConf {
    pub host: String,
    pub port: u16,
}

impl TargetConf {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Raw flag values, before validation. The CLI layer fills this in;
/// everything else consumes [`Conf`].
#[derive(Debug, Default)]
pub struct ConfInput {
    pub socket_path: Option<String>,
    pub ingest_host: Option<String>,
    pub ingest_port: Option<u16>,
    pub search_host: Option<String>,
    pub search_port: Option<u16>,
    pub pool_capacity: Option<usize>,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub search_ca_file: Option<String>,
    pub search_cert_file: Option<String>,
    pub search_key_file: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct Conf {
    pub socket_path: Utf8PathBuf,
    pub ingest: TargetConf,
    pub search: TargetConf,
    pub pool_capacity: usize,
    pub tls_files: TlsFiles,
    /// Distinct material for the search service, when provided.
    pub search_tls_files: Option<TlsFiles>,
    pub debug: bool,
}

impl Conf {
    pub fn from_input(input: ConfInput) -> anyhow::Result<Self> {
        let socket_path = input
            .socket_path
            .map(Utf8PathBuf::from)
            .unwrap_or_else(default_socket_path);

        anyhow::ensure!(
            socket_path.parent().is_some_and(|parent| parent.as_std_path().is_dir()),
            "socket path {socket_path} has no usable parent directory",
        );

        let ingest = TargetConf {
            host: input.ingest_host.context("--ingest-host is required")?,
            port: input.ingest_port.unwrap_or(DEFAULT_INGEST_PORT),
        };

        let search = TargetConf {
            host: input.search_host.context("--search-host is required")?,
            port: input.search_port.unwrap_or(DEFAULT_SEARCH_PORT),
        };

        let pool_capacity = input.pool_capacity.unwrap_or(DEFAULT_POOL_CAPACITY);
        anyhow::ensure!(pool_capacity >= 1, "pool capacity must be at least 1");

        let tls_files = TlsFiles {
            ca_file: input.ca_file.context("--ca-file is required")?.into(),
            cert_file: input.cert_file.context("--cert-file is required")?.into(),
            key_file: input.key_file.context("--key-file is required")?.into(),
        };

        let search_tls_files = match (input.search_ca_file, input.search_cert_file, input.search_key_file) {
            (None, None, None) => None,
            (ca, cert, key) => Some(TlsFiles {
                ca_file: ca.context("--search-ca-file is required when overriding search TLS material")?.into(),
                cert_file: cert
                    .context("--search-cert-file is required when overriding search TLS material")?
                    .into(),
                key_file: key
                    .context("--search-key-file is required when overriding search TLS material")?
                    .into(),
            }),
        };

        Ok(Conf {
            socket_path,
            ingest,
            search,
            pool_capacity,
            tls_files,
            search_tls_files,
            debug: input.debug,
        })
    }

    /// Search material, falling back to the primary set.
    pub fn search_tls_files(&self) -> &TlsFiles {
        self.search_tls_files.as_ref().unwrap_or(&self.tls_files)
    }
}

fn default_socket_path() -> Utf8PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| String::from("/tmp"));

    Utf8PathBuf::from(runtime_dir).join(DEFAULT_SOCKET_FILENAME)
}
