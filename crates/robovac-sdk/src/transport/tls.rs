//! TLS client configuration for robot connections.
//!
//! Robots present self-signed, device-local certificates, so the peer
//! certificate is not validated. The cipher list uses OpenSSL-style names
//! (`ROBOT_CIPHERS`); names rustls has no implementation for are skipped, and
//! if nothing usable is left the provider defaults apply.

use std::sync::Arc;

use rumqttc::tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme, SupportedCipherSuite};
use tracing::{debug, warn};

use crate::error::{SdkError, SdkResult};

/// OpenSSL cipher names and the rustls suite they correspond to.
const CIPHER_ALIASES: &[(&str, &str)] = &[
    ("TLS_AES_128_GCM_SHA256", "TLS13_AES_128_GCM_SHA256"),
    ("TLS_AES_256_GCM_SHA384", "TLS13_AES_256_GCM_SHA384"),
    ("TLS_CHACHA20_POLY1305_SHA256", "TLS13_CHACHA20_POLY1305_SHA256"),
    ("ECDHE-ECDSA-AES128-GCM-SHA256", "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"),
    ("ECDHE-ECDSA-AES256-GCM-SHA384", "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"),
    ("ECDHE-ECDSA-CHACHA20-POLY1305", "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"),
    ("ECDHE-RSA-AES128-GCM-SHA256", "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
    ("ECDHE-RSA-AES256-GCM-SHA384", "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384"),
    ("ECDHE-RSA-CHACHA20-POLY1305", "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"),
];

/// rustls suite name for a configured cipher name; unknown names pass through.
pub fn rustls_suite_name(cipher: &str) -> &str {
    CIPHER_ALIASES
        .iter()
        .find(|(openssl, _)| *openssl == cipher)
        .map(|(_, suite)| *suite)
        .unwrap_or(cipher)
}

/// Split a colon separated cipher list.
pub fn parse_cipher_list(ciphers: &str) -> Vec<&str> {
    ciphers
        .split([':', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect()
}

fn select_cipher_suites(
    ciphers: &str,
    available: &[SupportedCipherSuite],
) -> Vec<SupportedCipherSuite> {
    let mut selected = Vec::new();
    for cipher in parse_cipher_list(ciphers) {
        let wanted = rustls_suite_name(cipher);
        match available
            .iter()
            .find(|suite| format!("{:?}", suite.suite()) == wanted)
        {
            Some(suite) => selected.push(*suite),
            None => debug!("Cipher {} is not available, skipping", cipher),
        }
    }
    selected
}

/// Accepts whatever certificate the robot presents.
#[derive(Debug)]
struct AcceptDeviceCertificate;

impl ServerCertVerifier for AcceptDeviceCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build the client configuration used for every robot connection.
pub fn client_config(ciphers: &str) -> SdkResult<rustls::ClientConfig> {
    let defaults = ring::default_provider();
    let mut cipher_suites = select_cipher_suites(ciphers, &defaults.cipher_suites);
    if cipher_suites.is_empty() {
        warn!(
            "None of the ciphers '{}' is supported, using the default cipher suites",
            ciphers
        );
        cipher_suites = defaults.cipher_suites.clone();
    }

    let provider = CryptoProvider {
        cipher_suites,
        ..defaults
    };

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| SdkError::Configuration(format!("Unusable cipher list '{}': {}", ciphers, e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptDeviceCertificate))
        .with_no_client_auth();

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rustls_suite_name() {
        assert_eq!(
            rustls_suite_name("TLS_AES_256_GCM_SHA384"),
            "TLS13_AES_256_GCM_SHA384"
        );
        assert_eq!(
            rustls_suite_name("ECDHE-RSA-AES128-GCM-SHA256"),
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"
        );
        assert_eq!(rustls_suite_name("AES128-SHA256"), "AES128-SHA256");
    }

    #[test]
    fn test_parse_cipher_list() {
        assert_eq!(
            parse_cipher_list("AES128-SHA256: TLS_AES_256_GCM_SHA384,,"),
            vec!["AES128-SHA256", "TLS_AES_256_GCM_SHA384"]
        );
        assert!(parse_cipher_list("").is_empty());
    }

    #[test]
    fn test_select_known_suites() {
        let provider = ring::default_provider();
        let selected = select_cipher_suites(
            "AES128-SHA256:TLS_AES_128_GCM_SHA256",
            &provider.cipher_suites,
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(format!("{:?}", selected[0].suite()), "TLS13_AES_128_GCM_SHA256");
    }

    #[test]
    fn test_client_config_builds_for_default_ciphers() {
        assert!(client_config(crate::config::DEFAULT_CIPHERS).is_ok());
        assert!(client_config("ECDHE-RSA-AES128-GCM-SHA256").is_ok());
    }
}
