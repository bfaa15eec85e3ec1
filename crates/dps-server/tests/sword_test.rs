//! SWORD v2 transport against a mock repository

mod common;

use common::{manuscript, metadata, source_bytes};
use dps_common::{DepositStatus, RepositoryConfig, TransportKind};
use dps_server::packaging::{AssemblerConfig, Package, PackageAssembler, PackageFormat, SIMPLE_ZIP_PACKAGING};
use dps_server::resources::factory_for;
use dps_server::storage::ByteSource;
use dps_server::transport::{RemoteStatus, SwordTransport, Transport, TransportError};
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn repository(server: &MockServer) -> RepositoryConfig {
    RepositoryConfig::new(
        "sword-repo",
        TransportKind::SwordV2,
        format!("{}/sword/collection", server.uri()),
    )
}

async fn package(repository: &RepositoryConfig) -> Package {
    let source: Arc<dyn ByteSource> = Arc::new(source_bytes());
    let mut builder = factory_for(PackageFormat::SimpleZip).new_instance();
    for file in [manuscript(), metadata()] {
        builder.add(source.as_ref(), &file).await.unwrap();
    }
    let resources = builder.build();

    PackageAssembler::new(source, AssemblerConfig::default())
        .assemble(Uuid::new_v4(), &resources, repository)
        .await
        .unwrap()
}

fn receipt(server: &MockServer, with_statement: bool) -> String {
    let statement = if with_statement {
        format!(
            r#"<link rel="http://purl.org/net/sword/terms/statement" type="application/atom+xml;type=feed" href="{}/sword/statement/42.atom"/>"#,
            server.uri()
        )
    } else {
        String::new()
    };

    format!(
        r#"<?xml version="1.0"?>
<entry xmlns="http://www.w3.org/2005/Atom">
  <title>Deposit 42</title>
  <link rel="edit" href="{}/sword/edit/42"/>
  {}
</entry>"#,
        server.uri(),
        statement
    )
}

const ARCHIVED_STATEMENT: &str = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <category scheme="http://purl.org/net/sword/terms/state"
            term="http://purl.org/net/sword/terms/state/archived" label="State"/>
</feed>"#;

#[tokio::test]
async fn test_send_returns_edit_iri_from_location() {
    let server = MockServer::start().await;
    let config = repository(&server);
    let package = package(&config).await;

    Mock::given(method("POST"))
        .and(path("/sword/collection"))
        .and(header("Packaging", SIMPLE_ZIP_PACKAGING))
        .and(header("In-Progress", "false"))
        .and(header("Content-MD5", package.md5.as_str()))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", "/sword/edit/42")
                .set_body_string(receipt(&server, true)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let transport = SwordTransport::new().unwrap();
    let reference = transport.send(&package, &config).await.unwrap();

    assert_eq!(reference, format!("{}/sword/edit/42", server.uri()));
}

#[tokio::test]
async fn test_send_falls_back_to_receipt_edit_link() {
    let server = MockServer::start().await;
    let config = repository(&server);
    let package = package(&config).await;

    Mock::given(method("POST"))
        .and(path("/sword/collection"))
        .respond_with(ResponseTemplate::new(201).set_body_string(receipt(&server, false)))
        .mount(&server)
        .await;

    let reference = SwordTransport::new()
        .unwrap()
        .send(&package, &config)
        .await
        .unwrap();

    assert_eq!(reference, format!("{}/sword/edit/42", server.uri()));
}

#[tokio::test]
async fn test_send_rejection_carries_error_summary() {
    let server = MockServer::start().await;
    let config = repository(&server);
    let package = package(&config).await;

    Mock::given(method("POST"))
        .and(path("/sword/collection"))
        .respond_with(ResponseTemplate::new(413).set_body_string(
            r#"<sword:error xmlns="http://www.w3.org/2005/Atom" xmlns:sword="http://purl.org/net/sword/terms/">
                 <summary>Package exceeds the collection limit</summary>
               </sword:error>"#,
        ))
        .mount(&server)
        .await;

    let err = SwordTransport::new()
        .unwrap()
        .send(&package, &config)
        .await
        .unwrap_err();

    assert_eq!(
        err,
        TransportError::Rejected {
            status: Some(413),
            message: "Package exceeds the collection limit".to_string(),
        }
    );
}

#[tokio::test]
async fn test_send_auth_and_server_errors() {
    let server = MockServer::start().await;
    let config = repository(&server);
    let package = package(&config).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let transport = SwordTransport::new().unwrap();

    let err = transport.send(&package, &config).await.unwrap_err();
    assert!(matches!(err, TransportError::Authentication(_)));

    let err = transport.send(&package, &config).await.unwrap_err();
    assert!(matches!(err, TransportError::Network(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_query_status_follows_statement() {
    let server = MockServer::start().await;
    let config = repository(&server);

    Mock::given(method("GET"))
        .and(path("/sword/edit/42"))
        .respond_with(ResponseTemplate::new(200).set_body_string(receipt(&server, true)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sword/statement/42.atom"))
        .respond_with(ResponseTemplate::new(200).set_body_string(ARCHIVED_STATEMENT))
        .mount(&server)
        .await;

    let status = SwordTransport::new()
        .unwrap()
        .query_status(&format!("{}/sword/edit/42", server.uri()), &config)
        .await
        .unwrap();

    assert_eq!(status, RemoteStatus::Visible(DepositStatus::Accepted));
}

#[tokio::test]
async fn test_query_status_without_statement_is_not_yet_visible() {
    let server = MockServer::start().await;
    let config = repository(&server);

    Mock::given(method("GET"))
        .and(path("/sword/edit/42"))
        .respond_with(ResponseTemplate::new(200).set_body_string(receipt(&server, false)))
        .mount(&server)
        .await;

    let status = SwordTransport::new()
        .unwrap()
        .query_status(&format!("{}/sword/edit/42", server.uri()), &config)
        .await
        .unwrap();

    assert_eq!(status, RemoteStatus::NotYetVisible);
}

#[tokio::test]
async fn test_query_status_gone_receipt_is_not_found() {
    let server = MockServer::start().await;
    let config = repository(&server);

    Mock::given(method("GET"))
        .and(path("/sword/edit/42"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let status = SwordTransport::new()
        .unwrap()
        .query_status(&format!("{}/sword/edit/42", server.uri()), &config)
        .await
        .unwrap();

    assert_eq!(status, RemoteStatus::NotFound);
}
