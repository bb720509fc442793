use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use super::{Account, LedgerClient, LedgerError, LedgerMsg, LedgerSession, NodeParams, TxResult};

/// Ledger client talking to a REST gateway.
///
/// The gateway owns the node's signing key: it signs, broadcasts and waits
/// for inclusion of every submitted transaction.
#[derive(Clone, Debug)]
pub struct RestLedgerClient {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct BroadcastRequest<'a> {
    msgs: &'a [LedgerMsg],
}

impl RestLedgerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, LedgerError> {
        debug!("Querying ledger: GET {path}");
        let response = self.client.get(self.url(path)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(response.json().await?))
    }
}

async fn check_status(response: Response) -> Result<Response, LedgerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(LedgerError::UnexpectedResponse { status, message })
}

impl LedgerClient for RestLedgerClient {
    async fn account(&self, addr: &str) -> Result<Option<Account>, LedgerError> {
        self.get_optional(&format!("/accounts/{addr}")).await
    }

    async fn session(&self, id: u64) -> Result<Option<LedgerSession>, LedgerError> {
        self.get_optional(&format!("/sessions/{id}")).await
    }

    async fn node_params(&self) -> Result<NodeParams, LedgerError> {
        self.get_optional("/node/params")
            .await?
            .ok_or_else(|| LedgerError::Unavailable("node params not found".into()))
    }

    async fn broadcast_tx(
        &self,
        token: &CancellationToken,
        msgs: &[LedgerMsg],
    ) -> Result<TxResult, LedgerError> {
        debug!("Broadcasting transaction with {} message(s)", msgs.len());
        let request = self
            .client
            .post(self.url("/txs"))
            .json(&BroadcastRequest { msgs })
            .send();
        let response = tokio::select! {
            biased;
            () = token.cancelled() => {
                return Err(LedgerError::Unavailable("broadcast cancelled".into()));
            }
            response = request => response?,
        };
        let result: TxResult = check_status(response).await?.json().await?;
        if result.code != 0 {
            return Err(LedgerError::TxFailed {
                hash: result.hash,
                code: result.code,
                log: result.log,
            });
        }
        Ok(result)
    }
}
