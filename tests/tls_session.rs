//! End-to-end sessions over mutual TLS on loopback.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use net_transfer::prompt::FixedDecision;
use net_transfer::protocol::{Digest, DownloadOutcome, UploadOutcome};
use net_transfer::server::ApprovalPolicy;
use net_transfer::tls::{generate_self_signed_cert, GeneratedCert};
use net_transfer::{
    Client, ClientConfig, ClientIdentity, ClientTlsConfig, DirectoryCatalog, Server, ServerConfig,
    ServerTlsConfig,
};
use tokio::net::TcpListener;

fn certificate(name: &str) -> GeneratedCert {
    generate_self_signed_cert(name, &[name], &["127.0.0.1".parse().unwrap()]).unwrap()
}

async fn start_server(storage: &Path, tls_config: ServerTlsConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = ServerConfig {
        bind_addr: addr,
        storage_dir: storage.to_path_buf(),
        tls_config,
        max_file_size: 10 * 1000 * 1000,
        io_timeout: Some(Duration::from_secs(10)),
        idle_timeout: Some(Duration::from_secs(10)),
        single_shot: false,
        approval: ApprovalPolicy::Never,
    };
    let server = Server::new(config).with_decider(Arc::new(FixedDecision(true)));

    tokio::spawn(async move { server.serve(listener).await });
    addr
}

fn client(
    addr: SocketAddr,
    server_cert: &GeneratedCert,
    identity: Option<ClientIdentity>,
) -> Client {
    let tls_config =
        ClientTlsConfig::from_ca_pem(&server_cert.cert_pem, "localhost", identity).unwrap();
    Client::new(ClientConfig {
        server_addr: addr,
        tls_config,
        io_timeout: Some(Duration::from_secs(10)),
        approval_timeout: Some(Duration::from_secs(10)),
        show_progress: false,
    })
}

#[tokio::test]
async fn test_upload_then_download_round_trip() {
    let storage = tempfile::tempdir().unwrap();
    let outbox = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();

    let server_cert = certificate("localhost");
    let tls = ServerTlsConfig::from_pem(&server_cert.cert_pem, &server_cert.key_pem, None).unwrap();
    let addr = start_server(storage.path(), tls).await;

    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    std::fs::write(outbox.path().join("data.bin"), &payload).unwrap();

    let identity = ClientIdentity::ephemeral("client").unwrap();
    let mut session = client(addr, &server_cert, Some(identity))
        .connect()
        .await
        .unwrap();

    let outbox_catalog = DirectoryCatalog::new(outbox.path());
    let uploaded = match session.upload(&outbox_catalog, "data.bin").await.unwrap() {
        UploadOutcome::Accepted(descriptor) => descriptor,
        other => panic!("upload not accepted: {:?}", other),
    };
    assert_eq!(uploaded.digest, Digest::of_bytes(&payload));

    let inbox_catalog = DirectoryCatalog::new(inbox.path());
    match session.download_named(&inbox_catalog, "data.bin").await.unwrap() {
        DownloadOutcome::Completed(descriptor) => assert_eq!(descriptor, uploaded),
        other => panic!("download not completed: {:?}", other),
    }

    assert_eq!(std::fs::read(storage.path().join("data.bin")).unwrap(), payload);
    assert_eq!(std::fs::read(inbox.path().join("data.bin")).unwrap(), payload);
}

#[tokio::test]
async fn test_client_without_certificate_is_refused() {
    let storage = tempfile::tempdir().unwrap();
    std::fs::write(storage.path().join("a.txt"), b"a").unwrap();

    let server_cert = certificate("localhost");
    let tls = ServerTlsConfig::from_pem(&server_cert.cert_pem, &server_cert.key_pem, None).unwrap();
    let addr = start_server(storage.path(), tls).await;

    // With TLS 1.3 the client may only learn of the refusal on first read
    let refused = match client(addr, &server_cert, None).connect().await {
        Err(_) => true,
        Ok(session) => session.list().await.is_err(),
    };
    assert!(refused);
}

#[tokio::test]
async fn test_client_ca_pins_client_certificates() {
    let storage = tempfile::tempdir().unwrap();
    std::fs::write(storage.path().join("a.txt"), b"a").unwrap();

    let server_cert = certificate("localhost");
    let trusted = certificate("trusted-client");
    let tls = ServerTlsConfig::from_pem(
        &server_cert.cert_pem,
        &server_cert.key_pem,
        Some(&trusted.cert_pem),
    )
    .unwrap();
    let addr = start_server(storage.path(), tls).await;

    let identity = ClientIdentity::from_pem(&trusted.cert_pem, &trusted.key_pem).unwrap();
    let listing = client(addr, &server_cert, Some(identity))
        .connect()
        .await
        .unwrap()
        .list()
        .await
        .unwrap();
    assert_eq!(listing, vec!["a.txt".to_string()]);

    let stranger = ClientIdentity::ephemeral("stranger").unwrap();
    let refused = match client(addr, &server_cert, Some(stranger)).connect().await {
        Err(_) => true,
        Ok(session) => session.list().await.is_err(),
    };
    assert!(refused);
}
