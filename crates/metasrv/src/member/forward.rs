//! Request forwarding
//!
//! Non-leader meta servers accept every request but proxy the mutating
//! ones to the leader verbatim: same method, path, query and body, and the
//! leader's status and body are relayed untouched.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::Member;
use crate::error::{MetaError, Result};

/// Response relayed from the leader
pub struct ForwardedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

pub struct ForwardClient {
    member: Arc<Member>,
    http: reqwest::Client,
}

impl ForwardClient {
    pub fn new(member: Arc<Member>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetaError::internal("build forward client").with_cause(e))?;
        Ok(Self { member, http })
    }

    pub fn member(&self) -> &Arc<Member> {
        &self.member
    }

    /// Proxy one request to the current leader.
    pub async fn forward(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        content_type: Option<String>,
        body: Vec<u8>,
    ) -> Result<ForwardedResponse> {
        let leader = self.member.get_leader_addr().await?;
        let url = format!("http://{}{}", leader, path_and_query);
        debug!("forwarding {} {} to leader {}", method, path_and_query, leader);

        let mut request = self.http.request(method, &url).body(body);
        if let Some(content_type) = &content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        let response = request.send().await.map_err(|e| {
            MetaError::unavailable(format!("forward to leader {} failed", leader)).with_cause(e)
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|e| {
                MetaError::unavailable(format!("read leader {} response failed", leader))
                    .with_cause(e)
            })?
            .to_vec();
        Ok(ForwardedResponse {
            status,
            content_type,
            body,
        })
    }
}
