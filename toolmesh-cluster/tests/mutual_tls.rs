// gRPC over mutual TLS with throwaway certificates.

mod common;

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use tempfile::TempDir;

use common::spawn_host;
use toolmesh_cluster::transport::tls::server_tls_config;
use toolmesh_cluster::transport::{GrpcTransport, TlsPolicy, TransportExt};
use toolmesh_cluster::TlsSettings;

struct Pki {
    dir: TempDir,
}

impl Pki {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

fn write(dir: &Path, name: &str, pem: &str) {
    std::fs::write(dir.join(name), pem).unwrap();
}

fn leaf(
    names: Vec<String>,
    usage: ExtendedKeyUsagePurpose,
    ca: &Certificate,
    ca_key: &KeyPair,
) -> (String, String) {
    let mut params = CertificateParams::new(names).unwrap();
    params.extended_key_usages = vec![usage];
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, ca, ca_key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// A CA plus a server ("localhost") and a client certificate signed by it.
fn pki() -> Pki {
    let dir = TempDir::new().unwrap();

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca = ca_params.self_signed(&ca_key).unwrap();
    write(dir.path(), "ca.pem", &ca.pem());

    let (cert, key) = leaf(
        vec!["localhost".to_string()],
        ExtendedKeyUsagePurpose::ServerAuth,
        &ca,
        &ca_key,
    );
    write(dir.path(), "server.pem", &cert);
    write(dir.path(), "server.key", &key);

    let (cert, key) = leaf(
        vec!["client".to_string()],
        ExtendedKeyUsagePurpose::ClientAuth,
        &ca,
        &ca_key,
    );
    write(dir.path(), "client.pem", &cert);
    write(dir.path(), "client.key", &key);

    Pki { dir }
}

fn client_settings(pki: &Pki, with_identity: bool) -> TlsSettings {
    TlsSettings {
        enabled: true,
        cert_file: with_identity.then(|| pki.path("client.pem")),
        key_file: with_identity.then(|| pki.path("client.key")),
        ca_file: Some(pki.path("ca.pem")),
        server_name: Some("localhost".to_string()),
        insecure_skip_verify: false,
    }
}

#[tokio::test]
async fn test_mutual_tls_round_trip() {
    let pki = pki();
    let server_tls = server_tls_config(
        &pki.path("server.pem"),
        &pki.path("server.key"),
        Some(&pki.path("ca.pem")),
    )
    .unwrap();
    let host = spawn_host("secure", Some(server_tls)).await;

    let policy = TlsPolicy::build(&client_settings(&pki, true), false).unwrap();
    let transport = GrpcTransport::new("127.0.0.1", host.addr.port()).with_tls(policy);
    let pong = transport.ping().await.unwrap();
    assert_eq!(pong.status, "ok");

    let anonymous = TlsPolicy::build(&client_settings(&pki, false), false).unwrap();
    let rejected = GrpcTransport::new("127.0.0.1", host.addr.port()).with_tls(anonymous);
    assert!(rejected.ping().await.is_err());

    host.shutdown().await;
}

#[tokio::test]
async fn test_untrusted_server_is_rejected() {
    let pki = pki();
    let other = crate::pki();
    let server_tls = server_tls_config(&pki.path("server.pem"), &pki.path("server.key"), None)
        .unwrap();
    let host = spawn_host("secure", Some(server_tls)).await;

    let settings = TlsSettings {
        ca_file: Some(other.path("ca.pem")),
        ..client_settings(&pki, false)
    };
    let policy = TlsPolicy::build(&settings, false).unwrap();
    let transport = GrpcTransport::new("127.0.0.1", host.addr.port()).with_tls(policy);
    assert!(transport.ping().await.is_err());

    host.shutdown().await;
}
