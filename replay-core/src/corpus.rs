// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use crate::catalog::{Catalog, InsertError, Transaction};
use crate::error::LoadError;
use crate::fields::{FieldRule, FieldSet, MatchMode};
use crate::key::KeyFormat;
use crate::message::{status_text, HttpMessage, MessageContent, ProtocolFamily};
use crate::tls_policy::{HandshakeBehavior, PolicyRegistry, TlsDirectives};

/// Everything the serve loop needs out of a corpus load.
#[derive(Debug, Default)]
pub struct Loaded {
    pub catalog: Catalog,
    pub policies: PolicyRegistry,
}

#[derive(Debug, Deserialize)]
struct CorpusFile {
    #[allow(dead_code)]
    meta: Option<serde_yaml::Value>,
    sessions: Vec<SessionNode>,
}

#[derive(Debug, Deserialize)]
struct SessionNode {
    protocol: Option<Vec<ProtocolEntry>>,
    #[serde(default)]
    transactions: Vec<TxnNode>,
}

#[derive(Debug, Deserialize)]
struct ProtocolEntry {
    name: String,
    version: Option<serde_yaml::Value>,
    sni: Option<String>,
    #[serde(rename = "request-certificate")]
    request_certificate: Option<bool>,
    #[serde(rename = "proxy-provided-certificate")]
    proxy_provided_certificate: Option<bool>,
    #[serde(rename = "verify-mode")]
    verify_mode: Option<u32>,
    #[serde(rename = "alpn-protocols")]
    alpn_protocols: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TxnNode {
    all: Option<AllNode>,
    #[serde(rename = "client-request")]
    client_request: Option<MessageNode>,
    #[serde(rename = "proxy-request")]
    proxy_request: Option<MessageNode>,
    #[serde(rename = "server-response")]
    server_response: Option<MessageNode>,
}

#[derive(Debug, Deserialize)]
struct AllNode {
    headers: Option<HeadersNode>,
}

#[derive(Debug, Deserialize)]
struct HeadersNode {
    fields: Option<Vec<serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
struct MessageNode {
    protocol: Option<Vec<ProtocolEntry>>,
    method: Option<String>,
    url: Option<String>,
    scheme: Option<String>,
    authority: Option<String>,
    status: Option<u16>,
    reason: Option<String>,
    headers: Option<HeadersNode>,
    content: Option<ContentNode>,
    delay: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
struct ContentNode {
    size: Option<usize>,
    data: Option<String>,
    encoding: Option<String>,
    verify: Option<VerifyNode>,
}

#[derive(Debug, Deserialize)]
struct VerifyNode {
    #[serde(rename = "as")]
    mode: Option<String>,
}

/// Protocol stanza resolved to what the server cares about.
#[derive(Debug, Clone, Default)]
struct ProtocolInfo {
    family: ProtocolFamily,
    sni: Option<String>,
    directives: TlsDirectives,
    alpn: Vec<Vec<u8>>,
}

/// Load a replay file or a directory tree of replay files. Transaction
/// level problems are accumulated so every broken transaction in the
/// corpus gets reported in one pass.
pub fn load_corpus(path: &Path, key_format: &KeyFormat) -> Result<Loaded, Vec<LoadError>> {
    let mut loaded = Loaded::default();
    let mut errors = Vec::new();

    let files = match collect_files(path) {
        Ok(files) => files,
        Err(err) => return Err(vec![err]),
    };
    if files.is_empty() {
        return Err(vec![LoadError::EmptyCorpus {
            path: path.to_path_buf(),
        }]);
    }

    for file in files {
        load_file(&file, key_format, &mut loaded, &mut errors);
    }

    if errors.is_empty() {
        Ok(loaded)
    } else {
        Err(errors)
    }
}

fn collect_files(path: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let meta = fs::metadata(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|source| LoadError::Io {
            path: dir.clone(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| LoadError::Io {
                path: dir.clone(),
                source,
            })?;
            let entry_path = entry.path();
            if entry_path.is_dir() {
                stack.push(entry_path);
            } else if matches!(
                entry_path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                files.push(entry_path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn load_file(file: &Path, key_format: &KeyFormat, loaded: &mut Loaded, errors: &mut Vec<LoadError>) {
    let text = match fs::read_to_string(file) {
        Ok(text) => text,
        Err(source) => {
            errors.push(LoadError::Io {
                path: file.to_path_buf(),
                source,
            });
            return;
        }
    };
    let parsed: CorpusFile = match serde_yaml::from_str(&text) {
        Ok(parsed) => parsed,
        Err(source) => {
            errors.push(LoadError::Yaml {
                path: file.to_path_buf(),
                source,
            });
            return;
        }
    };

    let mut index = 0usize;
    for session in &parsed.sessions {
        let session_protocol = resolve_protocol(session.protocol.as_deref());
        for txn in &session.transactions {
            if let Err(err) = load_transaction(
                txn,
                &session_protocol,
                file,
                index,
                key_format,
                loaded,
            ) {
                errors.push(err);
            }
            index += 1;
        }
    }
    debug!(file = %file.display(), transactions = index, "loaded replay file");
}

fn load_transaction(
    node: &TxnNode,
    session_protocol: &ProtocolInfo,
    file: &Path,
    index: usize,
    key_format: &KeyFormat,
    loaded: &mut Loaded,
) -> Result<(), LoadError> {
    let Some(rsp_node) = &node.server_response else {
        return Err(LoadError::MissingResponse {
            path: file.to_path_buf(),
            index,
        });
    };

    // The transaction-scoped protocol stanza (on the proxy-request node)
    // overrides the session one.
    let protocol = match node.proxy_request.as_ref().and_then(|n| n.protocol.as_deref()) {
        Some(entries) => resolve_protocol(Some(entries)),
        None => session_protocol.clone(),
    };
    register_tls(&protocol, file, &mut loaded.policies)?;

    let mut key = String::new();

    let mut client = HttpMessage::request();
    if let Some(client_node) = &node.client_request {
        populate_message(client_node, &mut client, file)?;
        if let Some(derived) = key_format.key_for(&client) {
            key = derived;
        }
    }

    // Expectations come from the proxy-request stanza alone; the start
    // line is inherited from the client request when absent so key
    // templates keep working.
    let mut req = HttpMessage::request();
    req.method = client.method.clone();
    req.target = client.target.clone();
    req.scheme = client.scheme.clone();
    req.authority = client.authority.clone();
    if let Some(proxy_node) = &node.proxy_request {
        populate_message(proxy_node, &mut req, file)?;
    }
    if req.content.data.is_none() && req.content.size == 0 {
        req.content = client.content.clone();
        req.content.verify_equal = false;
    }
    if let Some(derived) = key_format.key_for(&req) {
        key = derived;
    }

    let mut rsp = HttpMessage::response();
    populate_message(rsp_node, &mut rsp, file)?;
    if rsp.status == 0 {
        return Err(LoadError::MissingStatus {
            path: file.to_path_buf(),
            index,
        });
    }
    if rsp.reason.is_empty() {
        rsp.reason = status_text(rsp.status).to_string();
    }
    let delay = parse_delay(rsp_node.delay.as_ref(), file)?;

    if let Some(all_node) = &node.all {
        let all = parse_fields(all_node.headers.as_ref(), file)?;
        req.merge_all(&all);
        rsp.merge_all(&all);
        if let Some(derived) = key_format.key_for(&req) {
            key = derived;
        }
    }

    req.protocol = protocol.family;
    rsp.protocol = protocol.family;
    req.update_transfer_encoding();
    rsp.update_transfer_encoding();

    if key.is_empty() {
        return Err(LoadError::KeyNotDerived {
            path: file.to_path_buf(),
            index,
            format: key_format.template().to_string(),
        });
    }

    match loaded.catalog.insert(key.clone(), Transaction { req, rsp, delay }) {
        Ok(()) => Ok(()),
        Err(InsertError::Duplicate) => Err(LoadError::DuplicateKey {
            path: file.to_path_buf(),
            key,
        }),
        Err(InsertError::EmptyKey) => Err(LoadError::KeyNotDerived {
            path: file.to_path_buf(),
            index,
            format: key_format.template().to_string(),
        }),
    }
}

fn resolve_protocol(entries: Option<&[ProtocolEntry]>) -> ProtocolInfo {
    let mut info = ProtocolInfo::default();
    let Some(entries) = entries else {
        return info;
    };
    for entry in entries {
        match entry.name.as_str() {
            "http" => {
                let version = entry
                    .version
                    .as_ref()
                    .and_then(scalar_to_string)
                    .unwrap_or_else(|| "1".to_string());
                info.family = match version.as_str() {
                    "2" => ProtocolFamily::Http2,
                    "3" => ProtocolFamily::Http3,
                    _ => ProtocolFamily::Http1,
                };
            }
            "tls" => {
                info.sni = entry.sni.clone().filter(|s| !s.is_empty());
                info.directives = TlsDirectives {
                    request_certificate: entry.request_certificate,
                    proxy_provided_certificate: entry.proxy_provided_certificate,
                    verify_mode: entry.verify_mode,
                };
                if let Some(protocols) = &entry.alpn_protocols {
                    info.alpn = protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
                }
            }
            // tcp/ip/udp entries carry nothing the server consumes.
            _ => {}
        }
    }
    info
}

fn register_tls(
    protocol: &ProtocolInfo,
    file: &Path,
    policies: &mut PolicyRegistry,
) -> Result<(), LoadError> {
    let Some(sni) = &protocol.sni else {
        return Ok(());
    };
    let verify_mode = protocol.directives.resolve().map_err(|()| {
        LoadError::TlsDirectiveConflict {
            path: file.to_path_buf(),
            sni: sni.clone(),
        }
    })?;
    let behavior = HandshakeBehavior {
        verify_mode,
        alpn: protocol.alpn.clone(),
    };
    policies
        .register(sni, behavior)
        .map_err(|()| LoadError::SniConflict { sni: sni.clone() })
}

fn populate_message(
    node: &MessageNode,
    msg: &mut HttpMessage,
    file: &Path,
) -> Result<(), LoadError> {
    if let Some(method) = &node.method {
        msg.method = method.clone();
    }
    if let Some(url) = &node.url {
        msg.target = url.clone();
    }
    if let Some(scheme) = &node.scheme {
        msg.scheme = scheme.clone();
    }
    if let Some(authority) = &node.authority {
        msg.authority = authority.clone();
    }
    if let Some(status) = node.status {
        msg.status = status;
    }
    if let Some(reason) = &node.reason {
        msg.reason = reason.clone();
    }
    let parsed = parse_fields(node.headers.as_ref(), file)?;
    msg.fields.merge(&parsed);
    if let Some(content) = &node.content {
        msg.content = parse_content(content, file)?;
    }
    Ok(())
}

fn parse_fields(headers: Option<&HeadersNode>, file: &Path) -> Result<FieldSet, LoadError> {
    let mut set = FieldSet::default();
    let Some(entries) = headers.and_then(|h| h.fields.as_ref()) else {
        return Ok(set);
    };
    for entry in entries {
        let serde_yaml::Value::Sequence(items) = entry else {
            return Err(LoadError::BadField {
                path: file.to_path_buf(),
                detail: "field entry is not a [name, value] list".to_string(),
            });
        };
        if items.len() < 2 || items.len() > 3 {
            return Err(LoadError::BadField {
                path: file.to_path_buf(),
                detail: format!("field entry has {} elements, expected 2 or 3", items.len()),
            });
        }
        let name = scalar_to_string(&items[0]).ok_or_else(|| LoadError::BadField {
            path: file.to_path_buf(),
            detail: "field name is not a scalar".to_string(),
        })?;
        let value = scalar_to_string(&items[1]).ok_or_else(|| LoadError::BadField {
            path: file.to_path_buf(),
            detail: format!("value of field {name:?} is not a scalar"),
        })?;
        set.add_field(name.clone(), value.clone());
        if let Some(rule_item) = items.get(2) {
            let rule_name = scalar_to_string(rule_item).ok_or_else(|| LoadError::BadField {
                path: file.to_path_buf(),
                detail: format!("rule of field {name:?} is not a scalar"),
            })?;
            let mode = match MatchMode::parse(&rule_name, &value) {
                Some(Ok(mode)) => mode,
                Some(Err(source)) => {
                    return Err(LoadError::BadRegex {
                        path: file.to_path_buf(),
                        pattern: value,
                        source,
                    })
                }
                None => {
                    return Err(LoadError::BadRule {
                        path: file.to_path_buf(),
                        rule: rule_name,
                    })
                }
            };
            set.add_rule(FieldRule {
                name: name.to_ascii_lowercase(),
                value,
                mode,
            });
        }
    }
    Ok(set)
}

fn parse_content(node: &ContentNode, file: &Path) -> Result<MessageContent, LoadError> {
    if let Some(encoding) = &node.encoding {
        if encoding != "plain" {
            return Err(LoadError::BadContent {
                path: file.to_path_buf(),
                detail: format!("unsupported content encoding {encoding:?}"),
            });
        }
    }
    let mut content = match (&node.data, node.size) {
        (Some(data), _) => MessageContent::literal(Bytes::from(data.clone().into_bytes())),
        (None, Some(size)) => MessageContent::synthesized(size),
        (None, None) => MessageContent::default(),
    };
    if let Some(verify) = &node.verify {
        match verify.mode.as_deref() {
            Some("equal") | None => {
                if content.data.is_none() {
                    return Err(LoadError::BadContent {
                        path: file.to_path_buf(),
                        detail: "content verification requires literal data".to_string(),
                    });
                }
                content.verify_equal = true;
            }
            Some(other) => {
                return Err(LoadError::BadContent {
                    path: file.to_path_buf(),
                    detail: format!("unsupported content verification {other:?}"),
                });
            }
        }
    }
    Ok(content)
}

fn parse_delay(
    value: Option<&serde_yaml::Value>,
    file: &Path,
) -> Result<Option<Duration>, LoadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let text = scalar_to_string(value).ok_or_else(|| LoadError::BadDelay {
        path: file.to_path_buf(),
        value: format!("{value:?}"),
    })?;
    let trimmed = text.trim();
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(d) = trimmed.strip_suffix("us") {
        (d, Duration::from_micros)
    } else if let Some(d) = trimmed.strip_suffix("ms") {
        (d, Duration::from_millis)
    } else if let Some(d) = trimmed.strip_suffix('s') {
        (d, Duration::from_secs)
    } else {
        return Err(LoadError::BadDelay {
            path: file.to_path_buf(),
            value: text,
        });
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|n| Some(unit(n)))
        .map_err(|_| LoadError::BadDelay {
            path: file.to_path_buf(),
            value: text.clone(),
        })
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
