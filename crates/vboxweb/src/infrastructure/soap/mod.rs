//! SOAP 1.1 transport for the vboxwebsrv endpoint.
//!
//! vboxwebsrv speaks RPC-style SOAP: every request body is a single
//! `<vbox:{Interface}_{method}>` element whose children are the named
//! arguments, and every response carries zero or more `<returnval>` elements.
//! Arrays are encoded by repeating the element.
//!
//! ```xml
//! <SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/"
//!                    xmlns:vbox="http://www.virtualbox.org/">
//!   <SOAP-ENV:Body>
//!     <vbox:IMachine_getState>
//!       <_this>0f4e5a1c3b2d9e87-0000000000000012</_this>
//!     </vbox:IMachine_getState>
//!   </SOAP-ENV:Body>
//! </SOAP-ENV:Envelope>
//! ```
//!
//! Errors come back as a standard SOAP fault (usually with HTTP 500); the
//! `faultstring` holds VirtualBox's error text, which the orchestrator
//! inspects for "not found" style messages.
//!
//! The envelope builder and response parser are pure functions so that they
//! can be tested without a server.

use std::time::Duration;

use async_trait::async_trait;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use tracing::{debug, trace, warn};

use crate::infrastructure::vbox_api::ApiError;

const SOAP_ENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const VBOX_NS: &str = "http://www.virtualbox.org/";

/// One RPC round-trip: send `method` with named `params`, receive every
/// `returnval` as text.
///
/// A parameter name may appear more than once; each occurrence becomes a
/// separate element (the SOAP array encoding).
#[async_trait]
pub trait SoapCall: Send + Sync {
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Vec<String>, ApiError>;
}

/// HTTP transport posting SOAP envelopes with `reqwest`.
#[derive(Debug, Clone)]
pub struct SoapTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl SoapTransport {
    /// Creates a transport for `endpoint` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the HTTP client cannot be built.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl SoapCall for SoapTransport {
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Vec<String>, ApiError> {
        let body = build_envelope(method, params);

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml; charset=utf-8"));
        // vboxwebsrv ignores the action value but SOAP 1.1 requires the header.
        headers.insert("SOAPAction", HeaderValue::from_static("\"\""));

        debug!(method, endpoint = %self.endpoint, "SOAP request");

        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ApiError::Transport(format!("{method}: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::Transport(format!("{method}: failed to read body: {e}")))?;

        trace!(method, status = status.as_u16(), bytes = text.len(), "SOAP response");

        match parse_response(method, &text) {
            Err(ApiError::Fault { message }) => {
                warn!(method, fault = %message, "SOAP fault");
                Err(ApiError::Fault { message })
            }
            Ok(_) | Err(_) if !status.is_success() => Err(ApiError::Http {
                status: status.as_u16(),
                body: truncate(&text, 500),
            }),
            other => other,
        }
    }
}

// ── Envelope construction ─────────────────────────────────────────────────────

/// Renders the request envelope for `method`, escaping every argument value.
pub fn build_envelope(method: &str, params: &[(&str, String)]) -> String {
    let mut args = String::new();
    for (name, value) in params {
        args.push_str(&format!("<{name}>{}</{name}>", escape(value.as_str())));
    }
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <SOAP-ENV:Envelope xmlns:SOAP-ENV=\"{SOAP_ENV_NS}\" xmlns:vbox=\"{VBOX_NS}\">\
         <SOAP-ENV:Body><vbox:{method}>{args}</vbox:{method}></SOAP-ENV:Body>\
         </SOAP-ENV:Envelope>"
    )
}

// ── Response parsing ──────────────────────────────────────────────────────────

/// Extracts every `returnval` from a response body.
///
/// Empty `returnval` elements yield empty strings so that array positions
/// are preserved.
///
/// # Errors
///
/// - [`ApiError::Fault`] when the body contains a SOAP fault.
/// - [`ApiError::UnexpectedResponse`] when the body is not well-formed XML.
pub fn parse_response(method: &str, xml: &str) -> Result<Vec<String>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut values = Vec::new();
    let mut fault: Option<String> = None;
    let mut in_fault = false;
    // Text of the element currently being captured, if it is one we care about.
    let mut capture: Option<(Capture, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"returnval" => capture = Some((Capture::ReturnVal, String::new())),
                b"faultstring" => capture = Some((Capture::FaultString, String::new())),
                b"Fault" => in_fault = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"returnval" => values.push(String::new()),
                b"faultstring" => fault = Some(String::new()),
                b"Fault" => fault = fault.or(Some(String::new())),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let Some((_, buf)) = capture.as_mut() {
                    let text = t.unescape().map_err(|e| unexpected(method, e))?;
                    buf.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"returnval" | b"faultstring" => match capture.take() {
                    Some((Capture::ReturnVal, text)) => values.push(text),
                    Some((Capture::FaultString, text)) => fault = Some(text),
                    None => {}
                },
                b"Fault" => {
                    in_fault = false;
                    fault = fault.or(Some(String::new()));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(unexpected(method, e)),
        }
    }

    if in_fault || fault.is_some() {
        let message = fault.filter(|m| !m.is_empty()).unwrap_or_else(|| "unknown SOAP fault".to_string());
        return Err(ApiError::Fault { message });
    }
    Ok(values)
}

#[derive(Debug, Clone, Copy)]
enum Capture {
    ReturnVal,
    FaultString,
}

fn unexpected(method: &str, e: impl std::fmt::Display) -> ApiError {
    ApiError::UnexpectedResponse {
        method: method.to_string(),
        detail: e.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
