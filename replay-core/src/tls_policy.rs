// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use tracing::debug;

/// Peer-certificate verification strictness for one SNI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    #[default]
    None,
    /// Request a certificate; verify it if the peer offers one.
    Peer,
    /// Request a certificate and fail the handshake without one.
    PeerFailIfNoCert,
}

impl VerifyMode {
    /// Map the corpus `verify-mode` integer: 0 is no verification, 1 asks
    /// for a peer certificate, anything higher also requires it.
    pub fn from_raw(raw: u32) -> VerifyMode {
        match raw {
            0 => VerifyMode::None,
            1 => VerifyMode::Peer,
            _ => VerifyMode::PeerFailIfNoCert,
        }
    }

    pub fn verifies_peer(self) -> bool {
        !matches!(self, VerifyMode::None)
    }
}

/// TLS accept-path behavior registered for one SNI.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandshakeBehavior {
    pub verify_mode: VerifyMode,
    /// ALPN protocols to offer; empty means the listener default.
    pub alpn: Vec<Vec<u8>>,
}

/// The three `tls` node directives as found on a protocol stanza. All are
/// optional but must agree with each other when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsDirectives {
    pub request_certificate: Option<bool>,
    pub proxy_provided_certificate: Option<bool>,
    pub verify_mode: Option<u32>,
}

impl TlsDirectives {
    /// Resolve the directives to a single verification posture, or report
    /// a conflict. Precedence follows the corpus semantics: an explicit
    /// verify-mode wins, then either certificate directive implies peer
    /// verification.
    pub fn resolve(&self) -> Result<VerifyMode, ()> {
        let rc = self.request_certificate;
        let ppc = self.proxy_provided_certificate;
        let vm = self.verify_mode;
        let vm_zero = vm == Some(0);
        let vm_positive = matches!(vm, Some(v) if v > 0);

        // Any two directives that are both present must imply the same
        // posture.
        let conflict = (ppc == Some(true) && rc == Some(false))
            || (ppc == Some(false) && rc == Some(true))
            || (ppc == Some(true) && vm_zero)
            || (ppc == Some(false) && vm_positive)
            || (rc == Some(true) && vm_zero)
            || (rc == Some(false) && vm_positive);
        if conflict {
            return Err(());
        }

        if let Some(raw) = vm {
            if raw > 0 {
                return Ok(VerifyMode::from_raw(raw));
            }
        }
        if rc == Some(true) || ppc == Some(true) {
            return Ok(VerifyMode::Peer);
        }
        Ok(VerifyMode::None)
    }
}

/// SNI-keyed registry of handshake behaviors, written while the corpus
/// loads and read lock-free by the TLS accept path afterwards.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    by_sni: HashMap<String, HandshakeBehavior>,
}

impl PolicyRegistry {
    /// Register a behavior for an SNI. Re-registering the identical
    /// behavior is idempotent; a distinct behavior for the same SNI is a
    /// load-time conflict reported to the caller.
    pub fn register(&mut self, sni: &str, behavior: HandshakeBehavior) -> Result<(), ()> {
        match self.by_sni.get(sni) {
            Some(existing) if *existing == behavior => Ok(()),
            Some(_) => Err(()),
            None => {
                debug!(sni, mode = ?behavior.verify_mode, "registered TLS handshake behavior");
                self.by_sni.insert(sni.to_string(), behavior);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, sni: &str) -> Option<&HandshakeBehavior> {
        self.by_sni.get(sni)
    }

    /// Whether any registered SNI asks for peer verification; decides
    /// whether client-auth server configs have to exist at startup.
    pub fn requires_client_auth(&self) -> bool {
        self.by_sni
            .values()
            .any(|b| b.verify_mode.verifies_peer())
    }

    pub fn is_empty(&self) -> bool {
        self.by_sni.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directives(
        rc: Option<bool>,
        ppc: Option<bool>,
        vm: Option<u32>,
    ) -> TlsDirectives {
        TlsDirectives {
            request_certificate: rc,
            proxy_provided_certificate: ppc,
            verify_mode: vm,
        }
    }

    #[test]
    fn verify_mode_wins_when_set() {
        let d = directives(Some(true), None, Some(3));
        assert_eq!(d.resolve(), Ok(VerifyMode::PeerFailIfNoCert));
    }

    #[test]
    fn certificate_directives_imply_peer() {
        assert_eq!(
            directives(Some(true), None, None).resolve(),
            Ok(VerifyMode::Peer)
        );
        assert_eq!(
            directives(None, Some(true), None).resolve(),
            Ok(VerifyMode::Peer)
        );
        assert_eq!(directives(None, None, None).resolve(), Ok(VerifyMode::None));
        assert_eq!(
            directives(Some(false), Some(false), Some(0)).resolve(),
            Ok(VerifyMode::None)
        );
    }

    #[test]
    fn disagreeing_directives_conflict() {
        // request-certificate: true with verify-mode: 0
        assert!(directives(Some(true), None, Some(0)).resolve().is_err());
        // proxy-provided-certificate: true with verify-mode: 0
        assert!(directives(None, Some(true), Some(0)).resolve().is_err());
        // claiming no proxy cert but verify > 0
        assert!(directives(None, Some(false), Some(1)).resolve().is_err());
        assert!(directives(Some(false), None, Some(2)).resolve().is_err());
        // the two booleans disagreeing
        assert!(directives(Some(true), Some(false), None).resolve().is_err());
        assert!(directives(Some(false), Some(true), None).resolve().is_err());
    }

    #[test]
    fn sni_conflicts_are_rejected_and_idempotent_registrations_are_not() {
        let mut registry = PolicyRegistry::default();
        let peer = HandshakeBehavior {
            verify_mode: VerifyMode::Peer,
            alpn: vec![],
        };
        registry.register("example.com", peer.clone()).unwrap();
        registry.register("example.com", peer).unwrap();
        assert!(registry
            .register(
                "example.com",
                HandshakeBehavior {
                    verify_mode: VerifyMode::None,
                    alpn: vec![],
                }
            )
            .is_err());
        assert!(registry.requires_client_auth());
    }
}
