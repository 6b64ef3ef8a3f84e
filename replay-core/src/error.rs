// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading a replay corpus or interpreting the
/// command-line key format. Every variant carries enough context to point
/// the user at the offending file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("transaction {index} in {} does not have a server-response", path.display())]
    MissingResponse { path: PathBuf, index: usize },

    #[error("server-response for transaction {index} in {} has no status", path.display())]
    MissingStatus { path: PathBuf, index: usize },

    #[error(
        "could not derive a key of format {format:?} for transaction {index} in {}",
        path.display()
    )]
    KeyNotDerived {
        path: PathBuf,
        index: usize,
        format: String,
    },

    #[error("duplicate transaction key {key:?} in {}", path.display())]
    DuplicateKey { path: PathBuf, key: String },

    #[error("malformed field entry in {}: {detail}", path.display())]
    BadField { path: PathBuf, detail: String },

    #[error("unknown verification rule {rule:?} in {}", path.display())]
    BadRule { path: PathBuf, rule: String },

    #[error("invalid regex {pattern:?} in {}: {source}", path.display())]
    BadRegex {
        path: PathBuf,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("bad delay value {value:?} in {}", path.display())]
    BadDelay { path: PathBuf, value: String },

    #[error("bad content node in {}: {detail}", path.display())]
    BadContent { path: PathBuf, detail: String },

    #[error(
        "the tls node for SNI {sni:?} in {} has conflicting request-certificate, \
         proxy-provided-certificate, and verify-mode values",
        path.display()
    )]
    TlsDirectiveConflict { path: PathBuf, sni: String },

    #[error("SNI {sni:?} registered twice with different handshake behaviors")]
    SniConflict { sni: String },

    #[error("invalid key format template {template:?}: {detail}")]
    BadKeyFormat { template: String, detail: String },

    #[error("no replay files found under {}", path.display())]
    EmptyCorpus { path: PathBuf },
}
