// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::message::HttpMessage;

/// One recorded request/response pair. The request template carries the
/// proxy-request expectations; the response template is what goes back on
/// the wire.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub req: HttpMessage,
    pub rsp: HttpMessage,
    pub delay: Option<Duration>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertError {
    EmptyKey,
    Duplicate,
}

const FILL_CYCLE: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// The process-wide transaction catalog: populated during corpus load,
/// finalized once, and read-only for the lifetime of the listeners.
#[derive(Debug, Default)]
pub struct Catalog {
    map: HashMap<String, Transaction>,
    fill: Bytes,
}

impl Catalog {
    pub fn insert(&mut self, key: String, txn: Transaction) -> Result<(), InsertError> {
        if key.is_empty() {
            return Err(InsertError::EmptyKey);
        }
        if self.map.contains_key(&key) {
            return Err(InsertError::Duplicate);
        }
        self.map.insert(key, txn);
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<&Transaction> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Materialize the shared synthetic body buffer: one allocation sized
    /// to the largest synthesized response body, aliased as a prefix by
    /// every response that declares a size without literal data.
    pub fn finalize(&mut self) {
        let max = self
            .map
            .values()
            .filter(|txn| txn.rsp.content.is_synthesized())
            .map(|txn| txn.rsp.content.size)
            .max()
            .unwrap_or(0);
        let mut buf = Vec::with_capacity(max);
        while buf.len() < max {
            let take = FILL_CYCLE.len().min(max - buf.len());
            buf.extend_from_slice(&FILL_CYCLE[..take]);
        }
        self.fill = Bytes::from(buf);
    }

    pub fn fill(&self) -> &Bytes {
        &self.fill
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageContent;

    fn txn(content: MessageContent) -> Transaction {
        let mut rsp = HttpMessage::response();
        rsp.status = 200;
        rsp.content = content;
        Transaction {
            req: HttpMessage::request(),
            rsp,
            delay: None,
        }
    }

    #[test]
    fn rejects_empty_and_duplicate_keys() {
        let mut catalog = Catalog::default();
        assert_eq!(
            catalog.insert(String::new(), txn(MessageContent::default())),
            Err(InsertError::EmptyKey)
        );
        assert!(catalog
            .insert("GET /x".to_string(), txn(MessageContent::default()))
            .is_ok());
        assert_eq!(
            catalog.insert("GET /x".to_string(), txn(MessageContent::default())),
            Err(InsertError::Duplicate)
        );
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn finalize_sizes_the_fill_to_the_largest_synthesized_body() {
        let mut catalog = Catalog::default();
        catalog
            .insert("a".to_string(), txn(MessageContent::synthesized(100)))
            .unwrap();
        catalog
            .insert("b".to_string(), txn(MessageContent::synthesized(40)))
            .unwrap();
        catalog
            .insert("c".to_string(), txn(MessageContent::literal(vec![0u8; 500])))
            .unwrap();
        catalog.finalize();

        // Literal bodies do not grow the shared buffer.
        assert_eq!(catalog.fill().len(), 100);

        let txn = catalog.lookup("b").unwrap();
        assert_eq!(txn.rsp.body(catalog.fill()).len(), 40);
    }

    #[test]
    fn finalize_with_no_synthesized_bodies_leaves_an_empty_fill() {
        let mut catalog = Catalog::default();
        catalog
            .insert("a".to_string(), txn(MessageContent::literal("hi")))
            .unwrap();
        catalog.finalize();
        assert!(catalog.fill().is_empty());
    }
}
