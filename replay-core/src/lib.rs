// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Data model and load-time logic for the replay origin server: recorded
//! HTTP messages and their verification rules, the transaction catalog,
//! the per-SNI TLS policy registry, the key-format template, and the YAML
//! corpus loader.

pub mod catalog;
pub mod corpus;
pub mod error;
pub mod fields;
pub mod key;
pub mod message;
pub mod tls_policy;

pub use catalog::{Catalog, Transaction};
pub use corpus::{load_corpus, Loaded};
pub use error::LoadError;
pub use fields::{FieldRule, FieldSet, MatchMode};
pub use key::{KeyFormat, DEFAULT_KEY_FORMAT};
pub use message::{status_text, HttpMessage, MessageContent, ProtocolFamily};
pub use tls_policy::{HandshakeBehavior, PolicyRegistry, TlsDirectives, VerifyMode};
