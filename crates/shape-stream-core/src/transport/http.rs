//! HTTP transport over reqwest

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use url::Url;

use super::Transport;
use crate::cancel::CancelSignal;
use crate::error::TransportError;
use crate::protocol::{ShapeRequest, TransportResponse};

/// GETs the shape endpoint with the request's query pairs
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: Url,
}

impl HttpTransport {
    pub fn new(url: Url) -> Self {
        Self::with_client(Client::new(), url)
    }

    pub fn with_client(client: Client, url: Url) -> Self {
        Self { client, url }
    }

    /// Shape endpoint, e.g. `http://localhost:3000/v1/shape`
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Full request URL with the query string appended
    pub fn build_url(&self, request: &ShapeRequest) -> Url {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in request.query_pairs() {
                query.append_pair(&key, &value);
            }
        }
        url
    }

    async fn send(&self, request: &ShapeRequest) -> Result<TransportResponse, TransportError> {
        let url = self.build_url(request);
        debug!(request_id = request.id, url = %url, "HttpTransport: GET");

        let mut builder = self.client.get(url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        request: ShapeRequest,
        signal: CancelSignal,
    ) -> Result<TransportResponse, TransportError> {
        tokio::select! {
            biased;
            reason = signal.cancelled() => {
                debug!(request_id = request.id, reason = %reason, "HttpTransport: aborted");
                Err(TransportError::Aborted(reason))
            }
            result = self.send(&request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelReason;
    use crate::protocol::{RequestKind, SnapshotOptions};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(kind: RequestKind) -> ShapeRequest {
        ShapeRequest {
            id: 1,
            kind,
            params: [("table".to_string(), "items".to_string())].into(),
            headers: BTreeMap::new(),
            offset: "-1".to_string(),
            handle: None,
            live: false,
        }
    }

    #[test]
    fn test_build_url() {
        let transport = HttpTransport::new(Url::parse("http://localhost:3000/v1/shape").unwrap());
        let url = transport.build_url(&request(RequestKind::Stream));
        assert_eq!(
            url.as_str(),
            "http://localhost:3000/v1/shape?table=items&offset=-1"
        );
    }

    #[test]
    fn test_build_snapshot_url_escapes_where() {
        let transport = HttpTransport::new(Url::parse("http://localhost:3000/v1/shape").unwrap());
        let options = SnapshotOptions {
            where_clause: Some("id > 5".to_string()),
            ..SnapshotOptions::with_limit(10)
        };
        let url = transport.build_url(&request(RequestKind::Snapshot(options)));
        assert_eq!(
            url.query(),
            Some("table=items&offset=-1&subset__limit=10&subset__where=id+%3E+5")
        );
    }

    #[tokio::test]
    async fn test_abort_on_signal() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let transport =
            HttpTransport::new(Url::parse(&format!("http://{addr}/v1/shape")).unwrap());
        let signal = CancelSignal::new();
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel(CancelReason::SystemWake);
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.fetch(request(RequestKind::Stream), signal),
        )
        .await
        .unwrap();
        assert_eq!(result, Err(TransportError::Aborted(CancelReason::SystemWake)));
        server.abort();
    }
}
