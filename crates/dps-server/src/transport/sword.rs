//! SWORD v2 transport
//!
//! Deposit: POST the package to the collection IRI (hint `collection_url`,
//! else the endpoint). The reference kept locally is the edit-IRI, taken
//! from the `Location` header or, failing that, the receipt's `edit` link.
//!
//! Status: GET the edit-IRI (deposit receipt), follow its statement link,
//! GET the statement and map the `sword:state` term.

use async_trait::async_trait;
use dps_common::{RepositoryConfig, TransportKind};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode, Url};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use super::{fold_remote_state, Credentials, RemoteStatus, Transport, TransportError};
use crate::packaging::{Package, PackagePayload};

pub const STATEMENT_REL: &str = "http://purl.org/net/sword/terms/statement";
pub const STATE_SCHEME: &str = "http://purl.org/net/sword/terms/state";

const USER_AGENT: &str = concat!("dps-server/", env!("CARGO_PKG_VERSION"));

fn network(e: reqwest::Error) -> TransportError {
    TransportError::Network(e.to_string())
}

/// Non-success statuses shared by deposit and retrieval
fn classify_status(status: StatusCode, context: &str) -> TransportError {
    match status.as_u16() {
        401 | 403 => TransportError::Authentication(format!("{} returned {}", context, status)),
        s if s >= 500 => TransportError::Network(format!("{} returned {}", context, status)),
        _ => TransportError::Protocol(format!("{} returned unexpected {}", context, status)),
    }
}

fn join_uri(base: &str, href: &str) -> Result<String, TransportError> {
    let base = Url::parse(base).map_err(|e| TransportError::Config(format!("invalid URL {}: {}", base, e)))?;
    base.join(href)
        .map(|u| u.to_string())
        .map_err(|e| TransportError::Protocol(format!("invalid link {}: {}", href, e)))
}

// ============================================================================
// Resolver
// ============================================================================

/// Fetches remote SWORD resources (receipts, statements) with the
/// repository's credentials
#[derive(Clone)]
pub struct Resolver {
    client: Client,
    credentials: Option<Credentials>,
}

impl Resolver {
    pub fn new(client: Client, credentials: Option<Credentials>) -> Self {
        Self { client, credentials }
    }

    /// Bytes at `uri`, or `None` when the server says it is gone (404/410)
    #[instrument(skip(self))]
    pub async fn resolve(&self, uri: &str) -> Result<Option<Vec<u8>>, TransportError> {
        let mut request = self.client.get(uri);
        if let Some(c) = &self.credentials {
            request = request.basic_auth(&c.username, Some(&c.secret));
        }

        let response = request.send().await.map_err(network)?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            debug!("{} is gone ({})", uri, status);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status, uri));
        }

        let body = response.bytes().await.map_err(network)?;
        Ok(Some(body.to_vec()))
    }
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DepositReceipt {
    pub edit_iri: Option<String>,
    pub statement_iri: Option<String>,
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn xml_error(e: quick_xml::Error) -> TransportError {
    TransportError::Protocol(format!("malformed SWORD document: {}", e))
}

/// Edit and statement links of an Atom deposit receipt
pub fn parse_receipt(xml: &[u8]) -> Result<DepositReceipt, TransportError> {
    let mut reader = Reader::from_reader(xml);
    let mut receipt = DepositReceipt::default();

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"link" => {
                let rel = attribute(&e, b"rel");
                let href = attribute(&e, b"href");
                match (rel.as_deref(), href) {
                    (Some("edit"), Some(href)) if receipt.edit_iri.is_none() => {
                        receipt.edit_iri = Some(href);
                    },
                    (Some(STATEMENT_REL), Some(href)) => {
                        let atom = attribute(&e, b"type").is_some_and(|t| t.contains("atom"));
                        if receipt.statement_iri.is_none() || atom {
                            receipt.statement_iri = Some(href);
                        }
                    },
                    _ => {},
                }
            },
            Event::Eof => break,
            _ => {},
        }
    }

    Ok(receipt)
}

/// State term of a statement, Atom (`category`) or OAI-ORE (`sword:state`)
pub fn parse_statement_state(xml: &[u8]) -> Result<Option<String>, TransportError> {
    let mut reader = Reader::from_reader(xml);

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                b"category" if attribute(&e, b"scheme").as_deref() == Some(STATE_SCHEME) => {
                    return Ok(attribute(&e, b"term"));
                },
                b"state" => {
                    if let Some(term) = attribute(&e, b"resource") {
                        return Ok(Some(term));
                    }
                },
                _ => {},
            },
            Event::Eof => return Ok(None),
            _ => {},
        }
    }
}

/// `atom:summary` (or `sword:verboseDescription`) of a SWORD error document
pub fn parse_error_summary(xml: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(xml);
    let mut current: Option<Vec<u8>> = None;
    let mut verbose = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => current = Some(e.local_name().as_ref().to_vec()),
            Ok(Event::End(_)) => current = None,
            Ok(Event::Text(t)) => {
                let text = t.unescape().ok()?.trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match current.as_deref() {
                    Some(b"summary") => return Some(text),
                    Some(b"verboseDescription") => verbose = Some(text),
                    _ => {},
                }
            },
            Ok(Event::Eof) | Err(_) => return verbose,
            _ => {},
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Clone)]
pub struct SwordTransport {
    client: Client,
}

impl SwordTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| TransportError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn body(package: &Package) -> Result<reqwest::Body, TransportError> {
        match package.payload() {
            PackagePayload::InMemory(bytes) => Ok(reqwest::Body::from(bytes.to_vec())),
            PackagePayload::Spooled(file) => {
                let file = tokio::fs::File::open(file.path())
                    .await
                    .map_err(|e| TransportError::Protocol(format!("cannot read package: {}", e)))?;
                Ok(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            },
        }
    }
}

#[async_trait]
impl Transport for SwordTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SwordV2
    }

    #[instrument(skip(self, package, config), fields(repository_id = %config.id, file = %package.file_name))]
    async fn send(&self, package: &Package, config: &RepositoryConfig) -> Result<String, TransportError> {
        let credentials = Credentials::resolve(config)?;
        let collection = config.hint("collection_url").unwrap_or(&config.endpoint);

        let mut request = self
            .client
            .post(collection)
            .header(CONTENT_TYPE, package.media_type())
            .header(
                CONTENT_DISPOSITION,
                format!("attachment; filename={}", package.file_name),
            )
            .header(CONTENT_LENGTH, package.size)
            .header("Content-MD5", &package.md5)
            .header("Packaging", package.packaging_uri())
            .header("In-Progress", "false")
            .body(Self::body(package).await?);

        if let Some(on_behalf_of) = config.hint("on_behalf_of") {
            request = request.header("On-Behalf-Of", on_behalf_of);
        }
        if let Some(c) = &credentials {
            request = request.basic_auth(&c.username, Some(&c.secret));
        }

        debug!("POST {} ({} bytes)", collection, package.size);
        let response = request.send().await.map_err(network)?;
        let status = response.status();

        match status.as_u16() {
            201 | 202 => {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.bytes().await.map_err(network)?;

                let edit_iri = match location {
                    Some(location) => location,
                    None => parse_receipt(&body)?
                        .edit_iri
                        .ok_or_else(|| TransportError::Protocol("deposit receipt has no edit-IRI".into()))?,
                };
                let edit_iri = join_uri(collection, &edit_iri)?;

                info!("Deposit accepted for processing at {}", edit_iri);
                Ok(edit_iri)
            },
            400 | 412 | 413 | 415 => {
                let body = response.bytes().await.unwrap_or_default();
                let message = parse_error_summary(&body)
                    .unwrap_or_else(|| format!("repository refused deposit ({})", status));
                warn!(status = status.as_u16(), "SWORD deposit rejected: {}", message);
                Err(TransportError::Rejected {
                    status: Some(status.as_u16()),
                    message,
                })
            },
            _ => Err(classify_status(status, collection)),
        }
    }

    #[instrument(skip(self, config), fields(repository_id = %config.id))]
    async fn query_status(
        &self,
        reference: &str,
        config: &RepositoryConfig,
    ) -> Result<RemoteStatus, TransportError> {
        let resolver = Resolver::new(self.client.clone(), Credentials::resolve(config)?);

        let Some(receipt) = resolver.resolve(reference).await? else {
            return Ok(RemoteStatus::NotFound);
        };

        let Some(statement_iri) = parse_receipt(&receipt)?.statement_iri else {
            debug!("Receipt for {} has no statement yet", reference);
            return Ok(RemoteStatus::NotYetVisible);
        };
        let statement_iri = join_uri(reference, &statement_iri)?;

        let Some(statement) = resolver.resolve(&statement_iri).await? else {
            return Ok(RemoteStatus::NotYetVisible);
        };

        Ok(match parse_statement_state(&statement)? {
            Some(term) => RemoteStatus::Visible(fold_remote_state(&term)),
            None => RemoteStatus::NotYetVisible,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dps_common::DepositStatus;

    const RECEIPT: &str = r#"<?xml version="1.0"?>
<entry xmlns="http://www.w3.org/2005/Atom" xmlns:sword="http://purl.org/net/sword/terms/">
  <title>Deposit</title>
  <link rel="edit" href="https://repo.example.org/sword/edit/42"/>
  <link rel="edit-media" href="https://repo.example.org/sword/media/42"/>
  <link rel="http://purl.org/net/sword/terms/statement" type="application/rdf+xml" href="https://repo.example.org/sword/statement/42.rdf"/>
  <link rel="http://purl.org/net/sword/terms/statement" type="application/atom+xml;type=feed" href="/sword/statement/42.atom"/>
</entry>"#;

    #[test]
    fn test_parse_receipt_prefers_atom_statement() {
        let receipt = parse_receipt(RECEIPT.as_bytes()).unwrap();
        assert_eq!(receipt.edit_iri.as_deref(), Some("https://repo.example.org/sword/edit/42"));
        assert_eq!(receipt.statement_iri.as_deref(), Some("/sword/statement/42.atom"));
    }

    #[test]
    fn test_parse_atom_statement() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
            <category scheme="http://purl.org/net/sword/terms/state"
                      term="http://purl.org/net/sword/terms/state/archived" label="State"/>
        </feed>"#;
        let term = parse_statement_state(xml.as_bytes()).unwrap().unwrap();
        assert_eq!(fold_remote_state(&term), DepositStatus::Accepted);
    }

    #[test]
    fn test_parse_ore_statement() {
        let xml = r#"<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"
                             xmlns:sword="http://purl.org/net/sword/terms/">
            <rdf:Description rdf:about="https://repo.example.org/42">
              <sword:state rdf:resource="http://purl.org/net/sword/terms/state/rejected"/>
            </rdf:Description>
        </rdf:RDF>"#;
        let term = parse_statement_state(xml.as_bytes()).unwrap().unwrap();
        assert_eq!(fold_remote_state(&term), DepositStatus::Rejected);
    }

    #[test]
    fn test_statement_without_state() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>x</title></feed>"#;
        assert_eq!(parse_statement_state(xml.as_bytes()).unwrap(), None);
    }

    #[test]
    fn test_state_terms_fold() {
        assert_eq!(fold_remote_state("archived"), DepositStatus::Accepted);
        assert_eq!(fold_remote_state("http://purl.org/net/sword/terms/state/withdrawn"), DepositStatus::Rejected);
        assert_eq!(fold_remote_state("http://dspace.org/state/inreview"), DepositStatus::Submitted);
        assert_eq!(fold_remote_state("http://purl.org/net/sword/terms/state/inprogress"), DepositStatus::Submitted);
    }

    #[test]
    fn test_parse_error_summary() {
        let xml = r#"<sword:error xmlns="http://www.w3.org/2005/Atom" xmlns:sword="http://purl.org/net/sword/terms/"
                        href="http://purl.org/net/sword/error/ErrorContent">
            <title>ERROR</title>
            <summary>Package is missing the manuscript</summary>
            <sword:verboseDescription>stack trace</sword:verboseDescription>
        </sword:error>"#;
        assert_eq!(
            parse_error_summary(xml.as_bytes()).as_deref(),
            Some("Package is missing the manuscript")
        );
        assert_eq!(parse_error_summary(b"not xml <"), None);
    }

    #[test]
    fn test_join_uri() {
        assert_eq!(
            join_uri("https://repo.example.org/sword/edit/42", "/sword/statement/42.atom").unwrap(),
            "https://repo.example.org/sword/statement/42.atom"
        );
        assert_eq!(
            join_uri("https://a.example/x", "https://b.example/y").unwrap(),
            "https://b.example/y"
        );
    }
}
