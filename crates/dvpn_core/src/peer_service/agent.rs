use std::{collections::HashMap, time::Duration};

use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{PeerServiceError, PeerStatistic};

/// HTTP client of the local agent managing tunnel peers.
#[derive(Clone, Debug)]
pub struct PeerAgent {
    client: Client,
    base_url: Url,
}

#[derive(Serialize)]
struct AddPeerRequest<'a> {
    peer_id: &'a str,
    request: &'a Value,
}

#[derive(Deserialize)]
struct AddPeerResponse {
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct PeerCountResponse {
    count: usize,
}

impl PeerAgent {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PeerServiceError> {
        let base_url = Url::parse(base_url)
            .map_err(|err| PeerServiceError::Unavailable(format!("invalid agent URL: {err}")))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    // peer ids may contain `/` and `+`, so they always go through segment encoding.
    // Everything below `/peers/` is a peer id, collection queries live elsewhere.
    fn url(&self, segments: &[&str]) -> Result<Url, PeerServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| PeerServiceError::Unavailable("agent URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(super) async fn add_peer(
        &self,
        peer_id: &str,
        request: &Value,
    ) -> Result<Value, PeerServiceError> {
        let response = self
            .client
            .post(self.url(&["peers"])?)
            .json(&AddPeerRequest { peer_id, request })
            .send()
            .await?;
        let response: AddPeerResponse = check_status(response).await?.json().await?;
        Ok(response.data)
    }

    pub(super) async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerServiceError> {
        let response = self
            .client
            .delete(self.url(&["peers", peer_id])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PeerServiceError::PeerNotFound(peer_id.to_string()));
        }
        check_status(response).await?;
        Ok(())
    }

    pub(super) async fn has_peer(&self, peer_id: &str) -> Result<bool, PeerServiceError> {
        let response = self
            .client
            .get(self.url(&["peers", peer_id])?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(response).await?;
        Ok(true)
    }

    pub(super) async fn peer_statistics(
        &self,
    ) -> Result<HashMap<String, PeerStatistic>, PeerServiceError> {
        let response = self
            .client
            .get(self.url(&["stats"])?)
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    pub(super) async fn peer_count(&self) -> Result<usize, PeerServiceError> {
        let response = self
            .client
            .get(self.url(&["count"])?)
            .send()
            .await?;
        let response: PeerCountResponse = check_status(response).await?.json().await?;
        Ok(response.count)
    }
}

async fn check_status(response: Response) -> Result<Response, PeerServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(PeerServiceError::UnexpectedResponse { status, message })
}
