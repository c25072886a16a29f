//! Negotiation with the SignalR server.
//!
//! Before opening a transport, the client POSTs to `{hub}/negotiate` to learn
//! which transports the server offers and to obtain a connection token.
//! The server may instead redirect the client (e.g. to Azure SignalR Service)
//! with a new URL and access token, which is followed up to a fixed limit.

use http::{HeaderMap, StatusCode, header::ACCEPT};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::{TransportChoice, insert_bearer};
use crate::error::{Result, SignalRError};
use crate::protocol::TransferFormat;
use crate::transport::TransportKind;

/// Negotiate protocol version requested by this client.
pub const NEGOTIATE_VERSION: u32 = 1;

/// A transport offered by the server.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    #[serde(default)]
    pub transfer_formats: Vec<String>,
}

/// Successful negotiate payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateSuccess {
    pub connection_id: String,
    pub connection_token: Option<String>,
    pub negotiate_version: u32,
    pub available_transports: Vec<AvailableTransport>,
}

impl NegotiateSuccess {
    /// The value sent as `id` to the transport endpoint.
    pub fn transport_id(&self) -> &str {
        match &self.connection_token {
            Some(token) if self.negotiate_version > 0 => token,
            _ => &self.connection_id,
        }
    }
}

/// Response from the `/negotiate` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiateResponse {
    Success(NegotiateSuccess),
    Redirect { url: String, access_token: String },
    Error(String),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawNegotiateResponse {
    connection_id: Option<String>,
    connection_token: Option<String>,
    #[serde(default)]
    negotiate_version: u32,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    url: Option<String>,
    access_token: Option<String>,
    error: Option<String>,
}

impl NegotiateResponse {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let raw: RawNegotiateResponse = serde_json::from_slice(body)?;
        if let (Some(url), Some(access_token)) = (raw.url, raw.access_token) {
            return Ok(Self::Redirect { url, access_token });
        }
        if let Some(error) = raw.error {
            return Ok(Self::Error(error));
        }
        let connection_id = raw.connection_id.ok_or_else(|| {
            SignalRError::NegotiateFailed("response is missing connectionId".into())
        })?;
        Ok(Self::Success(NegotiateSuccess {
            connection_id,
            connection_token: raw.connection_token,
            negotiate_version: raw.negotiate_version,
            available_transports: raw.available_transports,
        }))
    }
}

/// What the connection needs to open its transport.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// Transport URL including the `id` query parameter.
    pub url: Url,
    pub transport: TransportKind,
    pub connection_id: String,
    /// Request headers, including any bearer token picked up from redirects.
    pub headers: HeaderMap,
}

/// Builds `{hub}/negotiate?negotiateVersion=1`, keeping the hub's own query.
pub fn negotiate_url(hub_url: &Url) -> Url {
    let mut negotiate_url = hub_url.clone();

    let mut path = negotiate_url.path().to_string();
    if path.ends_with('/') && path.len() > 1 {
        path.pop();
    }
    path.push_str("/negotiate");
    negotiate_url.set_path(&path);
    negotiate_url.set_fragment(None);
    negotiate_url
        .query_pairs_mut()
        .append_pair("negotiateVersion", &NEGOTIATE_VERSION.to_string());
    negotiate_url
}

/// Picks the best transport both sides support.
pub fn select_transport(
    requested: TransportChoice,
    format: TransferFormat,
    available: &[AvailableTransport],
) -> Result<TransportKind> {
    TransportKind::PREFERENCE
        .into_iter()
        .filter(|kind| requested.allows(*kind) && kind.supports(format))
        .find(|kind| {
            available.iter().any(|offered| {
                offered.transport == kind.as_str()
                    && (offered.transfer_formats.is_empty()
                        || offered.transfer_formats.iter().any(|f| f == format.as_str()))
            })
        })
        .ok_or(SignalRError::NoCompatibleTransport)
}

/// Performs the negotiate request, following redirects.
///
/// # Errors
///
/// * non-200 responses, server `error` payloads and exceeding
///   `max_redirects` are fatal;
/// * no overlap between `requested` and the advertised transports yields
///   [`SignalRError::NoCompatibleTransport`].
pub async fn negotiate(
    http: &reqwest::Client,
    hub_url: &Url,
    mut headers: HeaderMap,
    requested: TransportChoice,
    format: TransferFormat,
    max_redirects: u32,
) -> Result<Negotiated> {
    let mut url = hub_url.clone();
    let mut attempt = 0;

    loop {
        let negotiate_url = negotiate_url(&url);
        debug!("Negotiate URL: {}", negotiate_url);

        let response = http
            .post(negotiate_url)
            .headers(headers.clone())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(SignalRError::NegotiateStatus {
                status: status.as_u16(),
                body,
            });
        }

        match NegotiateResponse::from_slice(&response.bytes().await?)? {
            NegotiateResponse::Error(message) => return Err(SignalRError::NegotiateFailed(message)),
            NegotiateResponse::Redirect {
                url: redirect,
                access_token,
            } => {
                if attempt >= max_redirects {
                    return Err(SignalRError::RedirectLimitExceeded);
                }
                debug!(%redirect, attempt, "Following negotiate redirect");
                url = Url::parse(&redirect)?;
                insert_bearer(&mut headers, &access_token)?;
                attempt += 1;
            }
            NegotiateResponse::Success(success) => {
                let transport =
                    select_transport(requested, format, &success.available_transports)?;
                debug!(%transport, connection_id = %success.connection_id, "Negotiated transport");

                // Redirects only move the negotiate call; the transport
                // connects to the hub URL the caller gave.
                let mut transport_url = hub_url.clone();
                transport_url
                    .query_pairs_mut()
                    .append_pair("id", success.transport_id());
                return Ok(Negotiated {
                    url: transport_url,
                    transport,
                    connection_id: success.connection_id,
                    headers,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn offered(name: &str, formats: &[&str]) -> AvailableTransport {
        AvailableTransport {
            transport: name.into(),
            transfer_formats: formats.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn all_transports() -> serde_json::Value {
        json!([
            {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
            {"transport": "ServerSentEvents", "transferFormats": ["Text"]},
            {"transport": "LongPolling", "transferFormats": ["Text", "Binary"]}
        ])
    }

    #[test]
    fn negotiate_url_appends_path_and_version() {
        let url = Url::parse("http://localhost:5000/chathub/?tenant=a#frag").unwrap();
        assert_eq!(
            negotiate_url(&url).as_str(),
            "http://localhost:5000/chathub/negotiate?tenant=a&negotiateVersion=1"
        );
    }

    #[test]
    fn response_discrimination() {
        let redirect =
            NegotiateResponse::from_slice(br#"{"url":"http://other/hub","accessToken":"t"}"#).unwrap();
        assert_eq!(
            redirect,
            NegotiateResponse::Redirect {
                url: "http://other/hub".into(),
                access_token: "t".into()
            }
        );

        let error = NegotiateResponse::from_slice(br#"{"error":"nope"}"#).unwrap();
        assert_eq!(error, NegotiateResponse::Error("nope".into()));

        let success = NegotiateResponse::from_slice(
            br#"{"connectionId":"id","connectionToken":"tok","negotiateVersion":1,"availableTransports":[]}"#,
        )
        .unwrap();
        match success {
            NegotiateResponse::Success(s) => assert_eq!(s.transport_id(), "tok"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn version_zero_uses_connection_id() {
        let success = NegotiateSuccess {
            connection_id: "id".into(),
            connection_token: Some("tok".into()),
            negotiate_version: 0,
            available_transports: vec![],
        };
        assert_eq!(success.transport_id(), "id");
    }

    #[test]
    fn transport_preference_and_intersection() {
        let all = vec![
            offered("LongPolling", &["Text", "Binary"]),
            offered("ServerSentEvents", &["Text"]),
            offered("WebSockets", &["Text", "Binary"]),
        ];
        assert_eq!(
            select_transport(TransportChoice::All, TransferFormat::Text, &all).unwrap(),
            TransportKind::WebSockets
        );
        assert_eq!(
            select_transport(TransportChoice::LongPolling, TransferFormat::Text, &all).unwrap(),
            TransportKind::LongPolling
        );

        let no_ws = vec![offered("ServerSentEvents", &["Text"]), offered("LongPolling", &["Binary"])];
        assert_eq!(
            select_transport(TransportChoice::All, TransferFormat::Text, &no_ws).unwrap(),
            TransportKind::ServerSentEvents
        );
        assert_eq!(
            select_transport(TransportChoice::All, TransferFormat::Binary, &no_ws).unwrap(),
            TransportKind::LongPolling
        );
        assert!(matches!(
            select_transport(TransportChoice::WebSockets, TransferFormat::Text, &no_ws),
            Err(SignalRError::NoCompatibleTransport)
        ));
    }

    #[tokio::test]
    async fn successful_negotiation_builds_transport_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hub/negotiate"))
            .and(query_param("negotiateVersion", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connectionId": "abc",
                "connectionToken": "token-1",
                "negotiateVersion": 1,
                "availableTransports": all_transports()
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hub = Url::parse(&format!("{}/hub", server.uri())).unwrap();
        let negotiated = negotiate(
            &reqwest::Client::new(),
            &hub,
            HeaderMap::new(),
            TransportChoice::All,
            TransferFormat::Text,
            100,
        )
        .await
        .unwrap();

        assert_eq!(negotiated.transport, TransportKind::WebSockets);
        assert_eq!(negotiated.connection_id, "abc");
        assert_eq!(negotiated.url.as_str(), format!("{}/hub?id=token-1", server.uri()));
    }

    #[tokio::test]
    async fn redirect_is_followed_with_bearer_token_but_transport_uses_hub_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hub/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/service/hub", server.uri()),
                "accessToken": "azure-token"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/service/hub/negotiate"))
            .and(header("authorization", "Bearer azure-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connectionId": "xyz",
                "availableTransports": all_transports()
            })))
            .expect(1)
            .mount(&server)
            .await;

        let hub = Url::parse(&format!("{}/hub", server.uri())).unwrap();
        let negotiated = negotiate(
            &reqwest::Client::new(),
            &hub,
            HeaderMap::new(),
            TransportChoice::ServerSentEvents,
            TransferFormat::Text,
            100,
        )
        .await
        .unwrap();

        assert_eq!(negotiated.transport, TransportKind::ServerSentEvents);
        assert_eq!(
            negotiated.url.as_str(),
            format!("{}/hub?id=xyz", server.uri())
        );
        assert_eq!(negotiated.headers["authorization"], "Bearer azure-token");
    }

    #[tokio::test]
    async fn endless_redirects_hit_the_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/hub", server.uri()),
                "accessToken": "t"
            })))
            .expect(4)
            .mount(&server)
            .await;

        let hub = Url::parse(&format!("{}/hub", server.uri())).unwrap();
        let result = negotiate(
            &reqwest::Client::new(),
            &hub,
            HeaderMap::new(),
            TransportChoice::All,
            TransferFormat::Text,
            3,
        )
        .await;
        assert!(matches!(result, Err(SignalRError::RedirectLimitExceeded)));
    }

    #[tokio::test]
    async fn server_error_and_bad_status_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/denied/negotiate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": "Not allowed"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/missing/negotiate"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let denied = Url::parse(&format!("{}/denied", server.uri())).unwrap();
        let result = negotiate(&http, &denied, HeaderMap::new(), TransportChoice::All, TransferFormat::Text, 100).await;
        assert!(matches!(result, Err(SignalRError::NegotiateFailed(ref m)) if m == "Not allowed"));

        let missing = Url::parse(&format!("{}/missing", server.uri())).unwrap();
        let result = negotiate(&http, &missing, HeaderMap::new(), TransportChoice::All, TransferFormat::Text, 100).await;
        assert!(matches!(result, Err(SignalRError::NegotiateStatus { status: 404, .. })));
    }

    #[tokio::test]
    async fn no_overlap_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "connectionId": "abc",
                "availableTransports": [{"transport": "LongPolling", "transferFormats": ["Text"]}]
            })))
            .mount(&server)
            .await;

        let hub = Url::parse(&format!("{}/hub", server.uri())).unwrap();
        let result = negotiate(
            &reqwest::Client::new(),
            &hub,
            HeaderMap::new(),
            TransportChoice::WebSockets,
            TransferFormat::Text,
            100,
        )
        .await;
        assert!(matches!(result, Err(SignalRError::NoCompatibleTransport)));
    }
}
