//! HTTP transport built on `reqwest`.
//!
//! Peers expose `POST /raft/request-vote`, `POST /raft/append-entries`
//! and `GET /health` on the same listener as the control surface.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use super::{Transport, TransportError};
use crate::raft::log::NodeInfo;
use crate::raft::message::{
    AppendEntries, AppendEntriesResponse, RequestVote, RequestVoteResponse,
};

pub struct HttpTransport {
    timeout: Duration,
    client: OnceLock<reqwest::Client>,
}

impl HttpTransport {
    /// `timeout` bounds every request, including connection setup.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::Client, TransportError> {
        self.client.get().ok_or(TransportError::NotInitialized)
    }

    async fn post<Req, Resp>(
        &self,
        target: NodeInfo,
        path: &'static str,
        body: Req,
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let client = self.client()?;
        let url = format!("{}{}", target.base_url(), path);
        let resp = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| unreachable(&target, e))?;
        if !resp.status().is_success() {
            return Err(TransportError::Rejected {
                node_id: target.id,
                status: resp.status().as_u16(),
            });
        }
        resp.json::<Resp>().await.map_err(|e| TransportError::Remote {
            node_id: target.id,
            reason: e.to_string(),
        })
    }
}

fn unreachable(target: &NodeInfo, err: reqwest::Error) -> TransportError {
    TransportError::Unreachable {
        node_id: target.id,
        reason: err.to_string(),
    }
}

impl Transport for HttpTransport {
    fn initialize(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            if self.client.get().is_some() {
                return Ok(());
            }
            let client = reqwest::Client::builder()
                .timeout(self.timeout)
                .connect_timeout(self.timeout)
                .build()
                .map_err(|e| TransportError::Init(e.to_string()))?;
            // A concurrent initializer may have won; either client is fine.
            let _ = self.client.set(client);
            info!(timeout_ms = self.timeout.as_millis() as u64, "HTTP transport ready");
            Ok(())
        })
    }

    fn request_vote(
        &self,
        target: &NodeInfo,
        request: RequestVote,
    ) -> Pin<Box<dyn Future<Output = Result<RequestVoteResponse, TransportError>> + Send + '_>>
    {
        let target = target.clone();
        Box::pin(self.post(target, "/raft/request-vote", request))
    }

    fn append_entries(
        &self,
        target: &NodeInfo,
        request: AppendEntries,
    ) -> Pin<Box<dyn Future<Output = Result<AppendEntriesResponse, TransportError>> + Send + '_>>
    {
        let target = target.clone();
        Box::pin(self.post(target, "/raft/append-entries", request))
    }

    fn ping(
        &self,
        target: &NodeInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        let target = target.clone();
        Box::pin(async move {
            let client = self.client()?;
            let url = format!("{}/health", target.base_url());
            let resp = client
                .get(&url)
                .send()
                .await
                .map_err(|e| unreachable(&target, e))?;
            if resp.status().is_success() {
                Ok(())
            } else {
                Err(TransportError::Rejected {
                    node_id: target.id,
                    status: resp.status().as_u16(),
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_calls_fail_before_initialize() {
        let transport = HttpTransport::new(Duration::from_millis(50));
        let target = NodeInfo::new(2, "127.0.0.1", 1);
        let err = transport.ping(&target).await.unwrap_err();
        assert!(matches!(err, TransportError::NotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let transport = HttpTransport::new(Duration::from_millis(50));
        transport.initialize().await.unwrap();
        transport.initialize().await.unwrap();
        assert!(transport.client().is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let transport = HttpTransport::new(Duration::from_millis(200));
        transport.initialize().await.unwrap();
        // Port 1 on loopback is not listening in any sane test environment.
        let target = NodeInfo::new(2, "127.0.0.1", 1);
        let err = transport
            .request_vote(
                &target,
                RequestVote {
                    term: 1,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                    pre_vote: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { node_id: 2, .. }));
    }
}
