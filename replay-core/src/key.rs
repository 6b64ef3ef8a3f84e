// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::error::LoadError;
use crate::message::HttpMessage;

pub const DEFAULT_KEY_FORMAT: &str = "{url}";

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Url,
    Path,
    Method,
    Scheme,
    Authority,
    Field(String),
}

/// The transaction key template. The same compiled template derives the
/// catalog key of each recorded transaction at load time and the lookup
/// key of each live request, which keeps the two symmetric by
/// construction.
#[derive(Debug, Clone)]
pub struct KeyFormat {
    template: String,
    segments: Vec<Segment>,
}

impl KeyFormat {
    pub fn parse(template: &str) -> Result<KeyFormat, LoadError> {
        let mut segments = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if !rest[..open].is_empty() {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let Some(close) = rest[open..].find('}') else {
                return Err(LoadError::BadKeyFormat {
                    template: template.to_string(),
                    detail: "unterminated '{'".to_string(),
                });
            };
            let name = &rest[open + 1..open + close];
            let segment = match name {
                "url" => Segment::Url,
                "path" => Segment::Path,
                "method" => Segment::Method,
                "scheme" => Segment::Scheme,
                "authority" => Segment::Authority,
                _ => match name.strip_prefix("field:") {
                    Some(field) if !field.is_empty() => Segment::Field(field.to_string()),
                    _ => {
                        return Err(LoadError::BadKeyFormat {
                            template: template.to_string(),
                            detail: format!("unknown placeholder {{{name}}}"),
                        })
                    }
                },
            };
            segments.push(segment);
            rest = &rest[open + close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }
        if segments.is_empty() {
            return Err(LoadError::BadKeyFormat {
                template: template.to_string(),
                detail: "empty template".to_string(),
            });
        }
        Ok(KeyFormat {
            template: template.to_string(),
            segments,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Derive the key for a message, or `None` when the message does not
    /// carry one of the referenced pieces (e.g. a proxy-request stanza
    /// without a url under the default `{url}` template).
    pub fn key_for(&self, msg: &HttpMessage) -> Option<String> {
        let mut key = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Url => {
                    if msg.target.is_empty() {
                        return None;
                    }
                    key.push_str(&msg.target);
                }
                Segment::Path => {
                    if msg.target.is_empty() {
                        return None;
                    }
                    let path = msg.target.split('?').next().unwrap_or("");
                    key.push_str(path);
                }
                Segment::Method => {
                    if msg.method.is_empty() {
                        return None;
                    }
                    key.push_str(&msg.method);
                }
                Segment::Scheme => {
                    if msg.scheme.is_empty() {
                        return None;
                    }
                    key.push_str(&msg.scheme);
                }
                Segment::Authority => {
                    if msg.authority.is_empty() {
                        return None;
                    }
                    key.push_str(&msg.authority);
                }
                Segment::Field(name) => key.push_str(msg.fields.get(name)?),
            }
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(method: &str, target: &str) -> HttpMessage {
        let mut msg = HttpMessage::request();
        msg.method = method.to_string();
        msg.target = target.to_string();
        msg
    }

    #[test]
    fn default_template_uses_the_url() {
        let format = KeyFormat::parse(DEFAULT_KEY_FORMAT).unwrap();
        let msg = message("GET", "/a/b?q=1");
        assert_eq!(format.key_for(&msg).as_deref(), Some("/a/b?q=1"));
    }

    #[test]
    fn path_strips_the_query() {
        let format = KeyFormat::parse("{method} {path}").unwrap();
        let msg = message("GET", "/a/b?q=1");
        assert_eq!(format.key_for(&msg).as_deref(), Some("GET /a/b"));
    }

    #[test]
    fn field_placeholder_reads_headers() {
        let format = KeyFormat::parse("{field:x-txn-id}").unwrap();
        let mut msg = message("GET", "/x");
        assert_eq!(format.key_for(&msg), None);
        msg.fields.add_field("X-Txn-Id", "42");
        assert_eq!(format.key_for(&msg).as_deref(), Some("42"));
    }

    #[test]
    fn missing_pieces_yield_no_key() {
        let format = KeyFormat::parse("{url}").unwrap();
        let msg = message("GET", "");
        assert_eq!(format.key_for(&msg), None);
    }

    #[test]
    fn bad_templates_are_rejected() {
        assert!(KeyFormat::parse("{nope}").is_err());
        assert!(KeyFormat::parse("{url").is_err());
        assert!(KeyFormat::parse("").is_err());
    }
}
