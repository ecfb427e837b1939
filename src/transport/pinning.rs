//! Certificate and public-key pinning.
//!
//! Pins are supplied as PEM (`PUBLIC KEY` or `CERTIFICATE` blocks), bare
//! base64 DER, or a path to a PEM/DER file. Public-key pins are compared
//! against the SHA-256 of each chain certificate's SubjectPublicKeyInfo,
//! certificate pins against the SHA-256 of the whole certificate. One match
//! anywhere in the presented chain is enough.
//!
//! Pinning runs after regular webpki chain validation, inside the rustls
//! handshake, so a mismatch fails the connection like any other TLS error.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};
use regex::Regex;
use rustls::client::{ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, RootCertStore, ServerName};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::error::{AgentError, Result};

type Fingerprint = [u8; 32];

static PEM_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)-----BEGIN ([A-Z0-9 ]+)-----(.*?)-----END [A-Z0-9 ]+-----").ok()
});

fn fingerprint(data: &[u8]) -> Fingerprint {
    Sha256::digest(data).into()
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| AgentError::Pinning(format!("invalid base64: {}", e)))
}

/// DER bytes of the first PEM block in `text`, or `None` if there is none.
fn decode_pem(text: &str) -> Option<Result<Vec<u8>>> {
    PEM_BLOCK
        .as_ref()?
        .captures(text)
        .and_then(|caps| caps.get(2))
        .map(|body| decode_base64(body.as_str()))
}

/// Resolves a pin source to DER bytes.
fn load_der(source: &str) -> Result<Vec<u8>> {
    let trimmed = source.trim();
    let path = Path::new(trimmed);
    if !trimmed.contains('\n') && path.is_file() {
        let data = std::fs::read(path)?;
        return match std::str::from_utf8(&data).ok().and_then(decode_pem) {
            Some(der) => der,
            None => Ok(data),
        };
    }
    match decode_pem(trimmed) {
        Some(der) => der,
        None => decode_base64(trimmed),
    }
}

fn certificate_spki(der: &[u8]) -> Option<Vec<u8>> {
    x509_parser::parse_x509_certificate(der)
        .ok()
        .map(|(_, cert)| cert.tbs_certificate.subject_pki.raw.to_vec())
}

/// Hashes of every configured pin.
#[derive(Debug, Clone, Default)]
pub struct PinSet {
    key_pins: Vec<Fingerprint>,
    cert_pins: Vec<Fingerprint>,
}

impl PinSet {
    pub fn from_sources(public_keys: &[String], certificates: &[String]) -> Result<Self> {
        let mut pins = PinSet::default();

        for source in public_keys {
            let der = load_der(source)?;
            // A certificate given as a key pin pins its public key.
            let spki = match certificate_spki(&der) {
                Some(spki) => spki,
                None => {
                    SubjectPublicKeyInfo::from_der(&der).map_err(|e| {
                        AgentError::Pinning(format!("not a public key or certificate: {}", e))
                    })?;
                    der
                }
            };
            pins.key_pins.push(fingerprint(&spki));
        }

        for source in certificates {
            let der = load_der(source)?;
            if certificate_spki(&der).is_none() {
                return Err(AgentError::Pinning("certificate pin is not an X.509 certificate".into()));
            }
            pins.cert_pins.push(fingerprint(&der));
        }

        debug!(
            "[transport] loaded {} key pins and {} certificate pins",
            pins.key_pins.len(),
            pins.cert_pins.len()
        );
        Ok(pins)
    }

    pub fn is_empty(&self) -> bool {
        self.key_pins.is_empty() && self.cert_pins.is_empty()
    }

    /// True when any certificate in `chain` (DER) matches any pin.
    pub fn matches_chain(&self, chain: &[&[u8]]) -> bool {
        if self.is_empty() {
            return true;
        }
        chain.iter().any(|der| {
            if self.cert_pins.contains(&fingerprint(der)) {
                return true;
            }
            certificate_spki(der)
                .map(|spki| self.key_pins.contains(&fingerprint(&spki)))
                .unwrap_or(false)
        })
    }
}

/// rustls verifier that applies webpki validation, then the pin set.
pub struct PinningVerifier {
    inner: WebPkiVerifier,
    pins: PinSet,
}

impl PinningVerifier {
    pub fn new(pins: PinSet) -> Self {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
        PinningVerifier {
            inner: WebPkiVerifier::new(roots, None),
            pins,
        }
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        scts: &mut dyn Iterator<Item = &[u8]>,
        ocsp_response: &[u8],
        now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            scts,
            ocsp_response,
            now,
        )?;

        let chain: Vec<&[u8]> = std::iter::once(end_entity)
            .chain(intermediates.iter())
            .map(|c| c.0.as_slice())
            .collect();
        if self.pins.matches_chain(&chain) {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!("[transport] no certificate in chain for {:?} matched a pin", server_name);
            Err(rustls::Error::General(
                "neither certificate nor public key passed pinning validation".into(),
            ))
        }
    }
}

/// TLS client configuration enforcing `pins`.
pub fn pinned_tls_config(pins: PinSet) -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(PinningVerifier::new(pins)))
        .with_no_client_auth()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CERT_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBiTCCAS+gAwIBAgIUX/FQdVHMkzA+hG/Zrqe5woBcLCMwCgYIKoZIzj0EAwIw
GTEXMBUGA1UEAwwOY29sbGVjdG9yLnRlc3QwIBcNMjYxMDE5MTcxOTEzWhgPMjEy
NjA5MjUxNzE5MTNaMBkxFzAVBgNVBAMMDmNvbGxlY3Rvci50ZXN0MFkwEwYHKoZI
zj0CAQYIKoZIzj0DAQcDQgAEmFldYNDOyi1KckUeOC7I4jLl30tgsCWGSU0WdRix
LQnfXwTaVeJtjPysREBqyMefYz0FJ38Hnfp6GP8nw/0AH6NTMFEwHQYDVR0OBBYE
FPiJ2tYYiOlUjf58BrvkwkVaBcQlMB8GA1UdIwQYMBaAFPiJ2tYYiOlUjf58Brvk
wkVaBcQlMA8GA1UdEwEB/wQFMAMBAf8wCgYIKoZIzj0EAwIDSAAwRQIhAMA6R/Mj
OLjtfsyxt656zN8duzfybiXSD3NdkG3QndcWAiAQSfZ352hmJ5HNSwyWbzLMMzKs
c4rpFIiIt4GXVMBN7g==
-----END CERTIFICATE-----";

    const KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEmFldYNDOyi1KckUeOC7I4jLl30tg
sCWGSU0WdRixLQnfXwTaVeJtjPysREBqyMefYz0FJ38Hnfp6GP8nw/0AHw==
-----END PUBLIC KEY-----";

    const OTHER_KEY_PEM: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEmFldYNDOyi1KckUeOC7I4jLl30tg
sCWGSU0WdRixLQnfXwTaVeJtjPysREBqyMefYz0FJ38Hnfp6GP8nw/0AHg==
-----END PUBLIC KEY-----";

    fn cert_der() -> Vec<u8> {
        load_der(CERT_PEM).unwrap()
    }

    fn hex(data: &[u8]) -> String {
        data.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_pem_decoding_matches_openssl_fingerprints() {
        let der = cert_der();
        assert_eq!(
            hex(&fingerprint(&der)),
            "eaa0ae5a3c2ef64709266868b4af746b2b0aa1d2b88d2e634d99d7df45b2f316"
        );
        let spki = certificate_spki(&der).unwrap();
        assert_eq!(
            hex(&fingerprint(&spki)),
            "bb5f8583a27d0c5dd076a161e6fb8479ee4b382fe23862baf9eff30a211610dd"
        );
    }

    #[test]
    fn test_public_key_pin_matches_chain() {
        let pins = PinSet::from_sources(&[KEY_PEM.to_string()], &[]).unwrap();
        let der = cert_der();
        assert!(pins.matches_chain(&[&der]));
    }

    #[test]
    fn test_certificate_pin_matches_chain() {
        let pins = PinSet::from_sources(&[], &[CERT_PEM.to_string()]).unwrap();
        let der = cert_der();
        assert!(pins.matches_chain(&[b"not a cert".as_slice(), &der]));
    }

    #[test]
    fn test_certificate_as_key_pin_uses_its_public_key() {
        let pins = PinSet::from_sources(&[CERT_PEM.to_string()], &[]).unwrap();
        let der = cert_der();
        assert!(pins.matches_chain(&[&der]));
    }

    #[test]
    fn test_mismatch_rejected() {
        let pins = PinSet::from_sources(&[OTHER_KEY_PEM.to_string()], &[]);
        // The altered key is no longer a valid point, either outcome must not match.
        if let Ok(pins) = pins {
            let der = cert_der();
            assert!(!pins.matches_chain(&[&der]));
        }
    }

    #[test]
    fn test_bare_base64_and_file_sources() {
        let der = cert_der();
        let bare = STANDARD.encode(&der);
        let pins = PinSet::from_sources(&[], &[bare]).unwrap();
        assert!(pins.matches_chain(&[&der]));

        let temp_dir = TempDir::new().unwrap();
        let pem_path = temp_dir.path().join("collector.pem");
        std::fs::write(&pem_path, CERT_PEM).unwrap();
        let der_path = temp_dir.path().join("collector.der");
        std::fs::write(&der_path, &der).unwrap();

        let pins = PinSet::from_sources(
            &[],
            &[
                pem_path.display().to_string(),
                der_path.display().to_string(),
            ],
        )
        .unwrap();
        assert!(pins.matches_chain(&[&der]));
    }

    #[test]
    fn test_empty_set_allows_everything() {
        let pins = PinSet::default();
        assert!(pins.is_empty());
        assert!(pins.matches_chain(&[b"anything".as_slice()]));
    }

    #[test]
    fn test_garbage_pin_is_a_config_error() {
        assert!(matches!(
            PinSet::from_sources(&["%%%".to_string()], &[]),
            Err(AgentError::Pinning(_))
        ));
        assert!(PinSet::from_sources(&[], &[KEY_PEM.to_string()]).is_err());
    }
}
