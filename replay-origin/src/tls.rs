// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{self, RootCertStore, ServerConfig};
use tracing::{debug, warn};

use replay_core::{PolicyRegistry, VerifyMode};

/// ALPN protocols offered when the corpus does not pin a list for the SNI.
pub const DEFAULT_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

fn setup_error(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, detail.into())
}

/// TLS accept-path state shared by every HTTPS listener: the prebuilt
/// server configs for each verification posture and the SNI policy
/// registry that picks between them per ClientHello.
pub struct TlsContext {
    policies: PolicyRegistry,
    default_config: Arc<ServerConfig>,
    peer_config: Option<Arc<ServerConfig>>,
    require_config: Option<Arc<ServerConfig>>,
}

pub struct TlsOptions<'a> {
    pub server_cert: &'a Path,
    pub ca_certs: Option<&'a Path>,
    pub secrets_log: Option<&'a Path>,
}

impl TlsContext {
    pub fn new(options: TlsOptions<'_>, policies: PolicyRegistry) -> io::Result<TlsContext> {
        let (certs, key) = load_server_cert(options.server_cert)?;

        let key_log: Option<Arc<SecretsLog>> = match options.secrets_log {
            Some(path) => Some(Arc::new(SecretsLog::create(path)?)),
            None => None,
        };

        let default_config = Arc::new(build_config(&certs, &key, None, key_log.as_ref())?);

        let (peer_config, require_config) = if policies.requires_client_auth() {
            let roots = match options.ca_certs {
                Some(path) => load_ca_certs(path)?,
                None => {
                    return Err(setup_error(
                        "the corpus asks for client certificate verification but no \
                         --ca-certs path was provided",
                    ))
                }
            };
            let roots = Arc::new(roots);
            let peer_verifier = WebPkiClientVerifier::builder(roots.clone())
                .allow_unauthenticated()
                .build()
                .map_err(|err| setup_error(format!("could not build client verifier: {err}")))?;
            let require_verifier = WebPkiClientVerifier::builder(roots)
                .build()
                .map_err(|err| setup_error(format!("could not build client verifier: {err}")))?;
            (
                Some(Arc::new(build_config(
                    &certs,
                    &key,
                    Some(peer_verifier),
                    key_log.as_ref(),
                )?)),
                Some(Arc::new(build_config(
                    &certs,
                    &key,
                    Some(require_verifier),
                    key_log.as_ref(),
                )?)),
            )
        } else {
            (None, None)
        };

        Ok(TlsContext {
            policies,
            default_config,
            peer_config,
            require_config,
        })
    }

    /// Pick the server config for a ClientHello. Consulted lock-free after
    /// load; unknown SNIs fall back to the default posture.
    pub fn config_for(&self, sni: Option<&str>) -> Arc<ServerConfig> {
        let behavior = sni.and_then(|name| self.policies.lookup(name));
        let verify_mode = behavior.map(|b| b.verify_mode).unwrap_or(VerifyMode::None);
        let base = match verify_mode {
            VerifyMode::None => &self.default_config,
            VerifyMode::Peer => match &self.peer_config {
                Some(config) => config,
                None => {
                    warn!(?sni, "no client-auth config available, using the default");
                    &self.default_config
                }
            },
            VerifyMode::PeerFailIfNoCert => match &self.require_config {
                Some(config) => config,
                None => {
                    warn!(?sni, "no client-auth config available, using the default");
                    &self.default_config
                }
            },
        };
        match behavior.filter(|b| !b.alpn.is_empty()) {
            Some(b) => {
                debug!(?sni, "using the corpus ALPN offer list");
                let mut config = (**base).clone();
                config.alpn_protocols = b.alpn.clone();
                Arc::new(config)
            }
            None => base.clone(),
        }
    }
}

fn build_config(
    certs: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
    verifier: Option<Arc<dyn rustls::server::danger::ClientCertVerifier>>,
    key_log: Option<&Arc<SecretsLog>>,
) -> io::Result<ServerConfig> {
    let builder = ServerConfig::builder();
    let builder = match verifier {
        Some(verifier) => builder.with_client_cert_verifier(verifier),
        None => builder.with_no_client_auth(),
    };
    let mut config = builder
        .with_single_cert(certs.to_vec(), key.clone_key())
        .map_err(|err| setup_error(format!("bad server certificate or key: {err}")))?;
    config.alpn_protocols = DEFAULT_ALPN.iter().map(|p| p.to_vec()).collect();
    if let Some(log) = key_log {
        config.key_log = log.clone();
    }
    Ok(config)
}

/// Load the server certificate chain and key. A directory means
/// `server.pem` + `server.key`; a file carries both.
fn load_server_cert(
    path: &Path,
) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let (cert_path, key_path): (PathBuf, PathBuf) = if path.is_dir() {
        (path.join("server.pem"), path.join("server.key"))
    } else {
        (path.to_path_buf(), path.to_path_buf())
    };
    let certs = read_certs(&cert_path)?;
    if certs.is_empty() {
        return Err(setup_error(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }
    let mut reader = open(&key_path)?;
    let key = rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| setup_error(format!("no private key found in {}", key_path.display())))?;
    Ok((certs, key))
}

/// Load CA roots from a certificate file or from every file in a
/// directory.
fn load_ca_certs(path: &Path) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let mut files = Vec::new();
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry_path = entry?.path();
            if entry_path.is_file() {
                files.push(entry_path);
            }
        }
        files.sort();
    } else {
        files.push(path.to_path_buf());
    }
    for file in files {
        for cert in read_certs(&file)? {
            roots
                .add(cert)
                .map_err(|err| setup_error(format!("bad CA cert in {}: {err}", file.display())))?;
        }
    }
    if roots.is_empty() {
        return Err(setup_error(format!(
            "no CA certificates found under {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn read_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    rustls_pemfile::certs(&mut reader).collect()
}

fn open(path: &Path) -> io::Result<BufReader<fs::File>> {
    Ok(BufReader::new(fs::File::open(path).map_err(|err| {
        setup_error(format!("could not open {}: {err}", path.display()))
    })?))
}

/// NSS-format key log sink for --tls-secrets-log-file, so captures of the
/// proxy's traffic can be decrypted.
#[derive(Debug)]
pub struct SecretsLog {
    file: Mutex<fs::File>,
}

impl SecretsLog {
    pub fn create(path: &Path) -> io::Result<SecretsLog> {
        let file = fs::File::create(path)
            .map_err(|err| setup_error(format!("could not create {}: {err}", path.display())))?;
        Ok(SecretsLog {
            file: Mutex::new(file),
        })
    }
}

impl rustls::KeyLog for SecretsLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{label} {} {}", hex(client_random), hex(secret));
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encodes_lowercase_pairs() {
        assert_eq!(hex(&[0x00, 0xab, 0x0f]), "00ab0f");
    }

    #[test]
    fn missing_cert_paths_error_out() {
        assert!(load_server_cert(Path::new("/nonexistent/server.pem")).is_err());
        assert!(load_ca_certs(Path::new("/nonexistent/ca.pem")).is_err());
    }
}
