// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::Level;

use crate::pool::DEFAULT_WORKER_LIMIT;

#[derive(Parser, Debug)]
#[clap(
    name = "replay-origin",
    version,
    about = "Replay-driven HTTP origin server for verifying proxy behavior"
)]
pub struct Cli {
    /// Verbosity: error, warn, info, or diag.
    #[clap(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub verbose: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the transactions recorded under a replay file or directory.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Replay file, or directory containing replay files.
    #[clap(value_name = "PATH")]
    pub corpus: PathBuf,

    /// Address and port to listen on for HTTP/1.x. Can be a comma
    /// separated list.
    #[clap(long, value_name = "ADDR:PORT[,...]")]
    pub listen_http: Option<String>,

    /// TLS address and port to listen on; serves HTTP/1.x or HTTP/2 as
    /// negotiated by ALPN. Can be a comma separated list.
    #[clap(long, value_name = "ADDR:PORT[,...]")]
    pub listen_https: Option<String>,

    // Server-side HTTP/3 is not implemented yet. Keep the option out of
    // the help text until it is.
    #[clap(long, value_name = "ADDR:PORT[,...]", hide = true)]
    pub listen_http3: Option<String>,

    /// Maximum number of workers handling concurrent connections.
    #[clap(long, value_name = "N", default_value_t = DEFAULT_WORKER_LIMIT)]
    pub thread_limit: usize,

    /// Verify recorded proxy-request fields as if they carried equality
    /// rules whenever no other verification rule is provided.
    #[clap(long, short = 's')]
    pub strict: bool,

    /// Transaction key format.
    #[clap(long, short = 'f', value_name = "TEMPLATE", default_value = "{url}")]
    pub format: String,

    /// TLS server certificate file containing both the public and private
    /// keys, or a directory containing server.pem and server.key files.
    #[clap(long, value_name = "PATH")]
    pub server_cert: Option<PathBuf>,

    /// TLS CA certificate file containing one or more certificates, or a
    /// directory of certificate files.
    #[clap(long, value_name = "PATH")]
    pub ca_certs: Option<PathBuf>,

    /// File to which TLS secrets are logged so captured traffic can be
    /// decrypted. No secrets are logged by default.
    #[clap(long, value_name = "PATH")]
    pub tls_secrets_log_file: Option<PathBuf>,
}

/// Map the --verbose option to a tracing level. `None` for unknown names.
pub fn verbosity_level(name: &str) -> Option<Level> {
    match name {
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "diag" => Some(Level::DEBUG),
        _ => None,
    }
}

/// Split a listen option's comma separated value into socket addresses.
/// The option itself takes a single occurrence; the list lives inside it.
pub fn parse_listen(value: Option<&str>) -> Result<Vec<SocketAddr>, String> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let mut addrs = Vec::new();
    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let resolved = part
            .to_socket_addrs()
            .map_err(|err| format!("could not resolve listen address {part:?}: {err}"))?
            .next();
        match resolved {
            Some(addr) => addrs.push(addr),
            None => return Err(format!("no usable address for {part:?}")),
        }
    }
    if addrs.is_empty() {
        return Err(format!("listen option {value:?} holds no addresses"));
    }
    Ok(addrs)
}
