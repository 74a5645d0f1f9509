//! Transport security for tool-host connections
//!
//! Builds a `rustls` client configuration with pinned protocol versions,
//! cipher suites and key-exchange groups. Client certificate and CA bundle
//! are optional (mutual TLS when both sides present certificates).
//!
//! `insecure_skip_verify` disables peer verification. It is refused outright
//! when `TOOLMESH_ENV` (or `APP_ENV`) says production and logged at `warn`
//! everywhere else.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::config::TlsSettings;
use crate::error::{Error, Result};

/// Environment variables consulted for the deployment environment, in order.
pub const ENVIRONMENT_VARS: [&str; 2] = ["TOOLMESH_ENV", "APP_ENV"];

static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Crypto provider restricted to AEAD suites with forward secrecy.
#[must_use]
pub fn pinned_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        kx_groups: vec![
            ring::kx_group::X25519,
            ring::kx_group::SECP384R1,
            ring::kx_group::SECP256R1,
        ],
        ..ring::default_provider()
    }
}

/// True when the process environment marks this deployment as production.
#[must_use]
pub fn production_environment() -> bool {
    ENVIRONMENT_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .any(|value| is_production(&value))
}

fn is_production(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "production" | "prod"
    )
}

/// Resolved client TLS policy, shared by every transport of a cluster.
#[derive(Clone)]
pub struct TlsPolicy {
    client_config: Arc<ClientConfig>,
    server_name: Option<String>,
    insecure: bool,
}

impl std::fmt::Debug for TlsPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsPolicy")
            .field("server_name", &self.server_name)
            .field("insecure", &self.insecure)
            .finish_non_exhaustive()
    }
}

impl TlsPolicy {
    /// `None` when TLS is disabled.
    pub fn from_settings(settings: &TlsSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        Self::build(settings, production_environment()).map(Some)
    }

    /// Build the policy, treating the deployment as production when
    /// `production` is set.
    pub fn build(settings: &TlsSettings, production: bool) -> Result<Self> {
        if settings.insecure_skip_verify {
            if production {
                return Err(Error::Configuration(
                    "insecure_skip_verify is not allowed in production".to_string(),
                ));
            }
            tracing::warn!(
                "TLS peer verification is DISABLED (insecure_skip_verify); \
                 connections are open to interception"
            );
        }

        let provider = Arc::new(pinned_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(PROTOCOL_VERSIONS)
            .map_err(|e| Error::Internal(format!("TLS protocol setup failed: {e}")))?;

        let builder = if settings.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier { provider }))
        } else {
            builder.with_root_certificates(root_store(settings.ca_file.as_deref())?)
        };

        let mut config = match (&settings.cert_file, &settings.key_file) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
                .map_err(|e| Error::Internal(format!("Invalid client certificate: {e}")))?,
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(Error::InvalidArgument(
                    "cert_file and key_file must be set together".to_string(),
                ))
            }
        };
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            client_config: Arc::new(config),
            server_name: settings.server_name.clone().filter(|s| !s.is_empty()),
            insecure: settings.insecure_skip_verify,
        })
    }

    #[must_use]
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    #[must_use]
    pub const fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Name presented via SNI and checked against the certificate: the
    /// configured override, or `host`.
    pub fn server_name(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        let name = name.trim_start_matches('[').trim_end_matches(']');
        ServerName::try_from(name.to_string())
            .map_err(|e| Error::InvalidArgument(format!("Invalid TLS server name '{name}': {e}")))
    }
}

/// Server-side TLS for a [`ToolServer`](super::ToolServer). Client
/// certificates are required when `client_ca` is given.
pub fn server_tls_config(
    cert_file: &Path,
    key_file: &Path,
    client_ca: Option<&Path>,
) -> Result<ServerTlsConfig> {
    let cert = read_file(cert_file)?;
    let key = read_file(key_file)?;
    let mut config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
    if let Some(ca) = client_ca {
        config = config.client_ca_root(Certificate::from_pem(read_file(ca)?));
    }
    Ok(config)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Internal(format!("Failed to read {}: {e}", path.display())))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Internal(format!("Failed to open {}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Internal(format!("Invalid PEM in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Internal(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| Error::Internal(format!("Invalid PEM in {}: {e}", path.display())))?
        .ok_or_else(|| Error::Internal(format!("No private key found in {}", path.display())))
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| {
                    Error::Internal(format!("Invalid CA certificate in {}: {e}", path.display()))
                })?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

mod danger {
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct NoVerifier {
        pub provider: Arc<CryptoProvider>,
    }

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.provider
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
