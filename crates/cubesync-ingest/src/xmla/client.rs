//! XMLA Execute client
//!
//! Sends an MDX statement to the cube's `/xmla/default` endpoint as a SOAP
//! `Execute` request and returns the raw response body.

use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::XmlaConfig;
use crate::error::{IngestError, Result};

pub const XMLA_ENDPOINT_SUFFIX: &str = "/xmla/default";
pub const SOAP_ACTION_EXECUTE: &str = "urn:schemas-microsoft-com:xml-analysis:Execute";

/// Build the full execute URL for a server root.
pub fn execute_url(server: &str) -> String {
    let server = server.trim_end_matches('/');
    if server.ends_with(XMLA_ENDPOINT_SUFFIX) {
        server.to_string()
    } else {
        format!("{}{}", server, XMLA_ENDPOINT_SUFFIX)
    }
}

/// Wrap text in CDATA, splitting any embedded `]]>` across sections.
fn cdata(text: &str) -> String {
    format!("<![CDATA[{}]]>", text.replace("]]>", "]]]]><![CDATA[>"))
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// SOAP envelope for a multidimensional `Execute` of `mdx` against `catalog`.
pub fn execute_envelope(mdx: &str, catalog: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
  <soap:Body>
    <Execute xmlns="urn:schemas-microsoft-com:xml-analysis">
      <Command>
        <Statement>{statement}</Statement>
      </Command>
      <Properties>
        <PropertyList>
          <Catalog>{catalog}</Catalog>
          <Format>Multidimensional</Format>
        </PropertyList>
      </Properties>
    </Execute>
  </soap:Body>
</soap:Envelope>"#,
        statement = cdata(mdx),
        catalog = escape_xml(catalog),
    )
}

/// Client for one XMLA server
pub struct XmlaClient {
    client: Client,
    url: String,
    username: String,
    password: String,
}

impl XmlaClient {
    pub fn new(config: &XmlaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(!config.ssl_verify)
            .build()?;

        Ok(Self {
            client,
            url: execute_url(&config.server),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Execute `mdx` and return the response XML.
    ///
    /// A non-success status is an error; the query is not retried.
    pub async fn execute(&self, mdx: &str, catalog: &str) -> Result<String> {
        let envelope = execute_envelope(mdx, catalog);
        debug!(url = %self.url, catalog, bytes = envelope.len(), "Sending XMLA Execute");

        let started = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .header(reqwest::header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .header("SOAPAction", SOAP_ACTION_EXECUTE)
            .body(envelope)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(IngestError::http(status.as_u16(), &body));
        }

        info!(
            catalog,
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "XMLA query complete"
        );
        Ok(body)
    }
}
