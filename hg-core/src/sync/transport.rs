//! HTTP seam between the reconcilers and the network
//!
//! Reconcilers only see status codes and raw bodies. Body decoding stays on
//! our side so that a malformed reply can still be inspected and logged.

use reqwest::blocking::{multipart, Client};
use tracing::debug;

use hg_protocol::{EDGE_KEY_HEADER, UPLOAD_FIELD_PERIOD, UPLOAD_PART_CSV, UPLOAD_PART_MANIFEST};

use crate::config::ServerConfig;
use crate::error::{HelmgateError, Result};

/// Status and undecoded body of a reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The two files of one period, ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadForm {
    pub period: String,
    pub csv_name: String,
    pub csv: Vec<u8>,
    pub manifest_name: String,
    pub manifest: Vec<u8>,
}

#[cfg_attr(test, mockall::automock)]
pub trait Transport {
    /// GET `url`; `authenticated` adds the shared-secret header
    fn get(&self, url: &str, authenticated: bool) -> Result<HttpResponse>;

    /// POST the period files as one multipart request, always authenticated
    fn post_upload(&self, url: &str, form: &UploadForm) -> Result<HttpResponse>;
}

/// Blocking reqwest client carrying the device's shared secret
pub struct HttpTransport {
    client: Client,
    edge_key: Option<String>,
}

fn transport_err(context: &str) -> impl FnOnce(reqwest::Error) -> HelmgateError + '_ {
    move |e| HelmgateError::transport(format!("{}: {}", context, e))
}

impl HttpTransport {
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(server.request_timeout())
            .user_agent(concat!("helmgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(transport_err("building HTTP client"))?;
        Ok(Self {
            client,
            edge_key: server.edge_api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn finish(resp: reqwest::blocking::Response, url: &str) -> Result<HttpResponse> {
        let status = resp.status().as_u16();
        let body = resp.bytes().map_err(transport_err(url))?.to_vec();
        debug!(url, status, bytes = body.len(), "HTTP reply");
        Ok(HttpResponse { status, body })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, authenticated: bool) -> Result<HttpResponse> {
        let mut req = self.client.get(url);
        if authenticated {
            if let Some(key) = &self.edge_key {
                req = req.header(EDGE_KEY_HEADER, key);
            }
        }
        let resp = req.send().map_err(transport_err(url))?;
        Self::finish(resp, url)
    }

    fn post_upload(&self, url: &str, form: &UploadForm) -> Result<HttpResponse> {
        let csv = multipart::Part::bytes(form.csv.clone())
            .file_name(form.csv_name.clone())
            .mime_str("text/csv")
            .map_err(transport_err("csv part"))?;
        let manifest = multipart::Part::bytes(form.manifest.clone())
            .file_name(form.manifest_name.clone())
            .mime_str("application/json")
            .map_err(transport_err("manifest part"))?;
        let body = multipart::Form::new()
            .text(UPLOAD_FIELD_PERIOD, form.period.clone())
            .part(UPLOAD_PART_CSV, csv)
            .part(UPLOAD_PART_MANIFEST, manifest);

        let mut req = self.client.post(url).multipart(body);
        if let Some(key) = &self.edge_key {
            req = req.header(EDGE_KEY_HEADER, key);
        }
        let resp = req.send().map_err(transport_err(url))?;
        Self::finish(resp, url)
    }
}
