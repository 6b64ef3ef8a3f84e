// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use replay_core::{load_corpus, KeyFormat};
use replay_origin::acceptor::{accept_loop, bind, ListenKind};
use replay_origin::config::{parse_listen, verbosity_level, Cli, Command, RunArgs};
use replay_origin::pool::{shutdown_channel, WorkerPool};
use replay_origin::tls::{TlsContext, TlsOptions};
use replay_origin::Engine;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Some(level) = verbosity_level(&cli.verbose) else {
        eprintln!("unrecognized verbosity option: {}", cli.verbose);
        process::exit(1);
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .init();
    ignore_sigpipe();

    let code = match cli.command {
        Command::Run(args) => run(args).await,
    };
    process::exit(code);
}

async fn run(args: RunArgs) -> i32 {
    if args.listen_http.is_none() && args.listen_https.is_none() && args.listen_http3.is_none() {
        error!(
            "must provide at least one of --listen-http, --listen-https, or --listen-http3"
        );
        return 1;
    }

    let mut endpoints = Vec::new();
    for (value, kind) in [
        (args.listen_http.as_deref(), ListenKind::Http),
        (args.listen_https.as_deref(), ListenKind::Https),
        (args.listen_http3.as_deref(), ListenKind::Http3),
    ] {
        match parse_listen(value) {
            Ok(addrs) => endpoints.extend(addrs.into_iter().map(|addr| (addr, kind))),
            Err(err) => {
                error!("{err}");
                return 1;
            }
        }
    }

    let key_format = match KeyFormat::parse(&args.format) {
        Ok(format) => format,
        Err(err) => {
            error!("{err}");
            return 1;
        }
    };

    let loaded = match load_corpus(&args.corpus, &key_format) {
        Ok(loaded) => loaded,
        Err(errors) => {
            for err in errors {
                error!("{err}");
            }
            return 1;
        }
    };
    let mut catalog = loaded.catalog;
    catalog.finalize();
    info!(
        "Ready with {} transaction{}.",
        catalog.len(),
        if catalog.len() == 1 { "" } else { "s" }
    );

    let needs_tls = endpoints
        .iter()
        .any(|(_, kind)| *kind == ListenKind::Https);
    let tls = if needs_tls {
        let Some(server_cert) = args.server_cert.as_deref() else {
            error!("--listen-https requires a --server-cert path");
            return 1;
        };
        let options = TlsOptions {
            server_cert,
            ca_certs: args.ca_certs.as_deref(),
            secrets_log: args.tls_secrets_log_file.as_deref(),
        };
        match TlsContext::new(options, loaded.policies) {
            Ok(context) => Some(Arc::new(context)),
            Err(err) => {
                error!("{err}");
                return 1;
            }
        }
    } else {
        None
    };

    let engine = Arc::new(Engine::new(catalog, key_format, args.strict));
    let pool = WorkerPool::new(args.thread_limit);
    let (shutdown_handle, shutdown) = shutdown_channel();

    let mut acceptors = Vec::new();
    for (addr, kind) in endpoints {
        match bind(addr) {
            Ok(listener) => {
                info!("Listening for {} at: {}", kind.describe(), addr);
                acceptors.push(tokio::spawn(accept_loop(
                    listener,
                    kind,
                    engine.clone(),
                    tls.clone(),
                    pool.clone(),
                    shutdown.clone(),
                )));
            }
            Err(err) => {
                // The listener is abandoned; the others keep going.
                error!(%addr, %err, "could not listen");
                engine.flag_error();
            }
        }
    }
    if acceptors.is_empty() {
        error!("no listeners could be set up");
        return 1;
    }

    if tokio::signal::ctrl_c().await.is_err() {
        warn!("could not wait for the interrupt signal; shutting down");
    }
    if engine.has_errors() {
        info!(
            "Handling the interrupt: shutting down and exiting with response code 1 \
             because errors have been seen."
        );
    } else {
        info!(
            "Handling the interrupt: shutting down and exiting with a 0 response code \
             because no errors have been seen."
        );
    }

    shutdown_handle.trigger();
    for acceptor in acceptors {
        let _ = acceptor.await;
    }
    pool.join().await;

    engine.exit_code()
}

#[cfg(unix)]
fn ignore_sigpipe() {
    // A peer-closed socket must surface as a write error, not abort the
    // process mid TLS write.
    unsafe {
        if libc::signal(libc::SIGPIPE, libc::SIG_IGN) == libc::SIG_ERR {
            warn!("could not ignore SIGPIPE; peer closes may terminate execution");
        }
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}
