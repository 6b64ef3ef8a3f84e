// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The serving engine of the replay origin: sessions over the supported
//! wire protocols, the worker pool, per-endpoint acceptors, the
//! connection handler, and the TLS accept path.

pub mod acceptor;
pub mod config;
pub mod handler;
pub mod pool;
pub mod session;
pub mod tls;

use std::sync::atomic::{AtomicBool, Ordering};

use replay_core::{Catalog, KeyFormat};

/// Process-wide serve state threaded through acceptors and workers: the
/// read-only catalog, the key template, the verification posture, and the
/// sticky error flag that decides the exit code.
pub struct Engine {
    pub catalog: Catalog,
    pub key_format: KeyFormat,
    pub strict: bool,
    errors_seen: AtomicBool,
}

impl Engine {
    pub fn new(catalog: Catalog, key_format: KeyFormat, strict: bool) -> Engine {
        Engine {
            catalog,
            key_format,
            strict,
            errors_seen: AtomicBool::new(false),
        }
    }

    pub fn flag_error(&self) {
        self.errors_seen.store(true, Ordering::Relaxed);
    }

    pub fn has_errors(&self) -> bool {
        self.errors_seen.load(Ordering::Relaxed)
    }

    pub fn exit_code(&self) -> i32 {
        if self.has_errors() {
            1
        } else {
            0
        }
    }
}
