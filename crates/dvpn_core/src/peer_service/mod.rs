//! Tunnel backends seen through a single capability set.

use std::{collections::HashMap, time::Duration};

use base64::{Engine, prelude::BASE64_STANDARD};
use chrono::NaiveDateTime;
use dvpn_common::types::{ByteCount, ServiceType};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

mod agent;

pub use agent::PeerAgent;

#[derive(Debug, Error)]
pub enum PeerServiceError {
    #[error("invalid peer request: {0}")]
    InvalidRequest(String),
    #[error("peer {0} not found")]
    PeerNotFound(String),
    #[error("peer service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("peer service responded with {status}: {message}")]
    UnexpectedResponse { status: StatusCode, message: String },
    #[error("peer service unavailable: {0}")]
    Unavailable(String),
}

/// Cumulative counters of a single peer as reported by the backend.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PeerStatistic {
    pub rx_bytes: ByteCount,
    pub tx_bytes: ByteCount,
    pub updated_at: NaiveDateTime,
}

/// Peer created by [`PeerService::add_peer`].
#[derive(Clone, Debug, PartialEq)]
pub struct AddedPeer {
    pub peer_id: String,
    /// Backend specific connection details handed back to the client.
    pub data: Value,
}

#[trait_variant::make(Send)]
pub trait PeerService: Send + Sync {
    fn service_type(&self) -> ServiceType;

    /// Derives the peer identifier from a connection request without side effects.
    fn peer_id(&self, payload: &[u8]) -> Result<String, PeerServiceError>;

    async fn add_peer(&self, payload: &[u8]) -> Result<AddedPeer, PeerServiceError>;

    async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerServiceError>;

    async fn has_peer(&self, peer_id: &str) -> Result<bool, PeerServiceError>;

    async fn peer_statistics(&self) -> Result<HashMap<String, PeerStatistic>, PeerServiceError>;

    async fn peer_count(&self) -> Result<usize, PeerServiceError>;
}

/// Removes the peer unless it is already gone. Returns whether a peer was removed.
pub async fn remove_peer_if_exists<P: PeerService>(
    service: &P,
    peer_id: &str,
) -> Result<bool, PeerServiceError> {
    if !service.has_peer(peer_id).await? {
        debug!("Peer {peer_id} is already absent from service");
        return Ok(false);
    }
    match service.remove_peer(peer_id).await {
        Ok(()) => {
            info!("Removed peer {peer_id} from service");
            Ok(true)
        }
        // removed concurrently between the two calls
        Err(PeerServiceError::PeerNotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

fn parse_request<T: DeserializeOwned>(payload: &[u8]) -> Result<T, PeerServiceError> {
    serde_json::from_slice(payload).map_err(|err| PeerServiceError::InvalidRequest(err.to_string()))
}

#[derive(Deserialize)]
struct WireguardPeerRequest {
    public_key: String,
}

#[derive(Deserialize)]
struct V2RayPeerRequest {
    uuid: String,
}

#[derive(Deserialize)]
struct OpenVpnPeerRequest {
    username: String,
}

/// WireGuard peers are identified by their base64 encoded curve25519 public key.
#[derive(Clone, Debug)]
pub struct WireguardPeerService {
    agent: PeerAgent,
}

/// V2Ray peers are identified by their client UUID.
#[derive(Clone, Debug)]
pub struct V2RayPeerService {
    agent: PeerAgent,
}

/// OpenVPN peers are identified by their login name.
#[derive(Clone, Debug)]
pub struct OpenVpnPeerService {
    agent: PeerAgent,
}

impl WireguardPeerService {
    fn derive_peer_id(payload: &[u8]) -> Result<String, PeerServiceError> {
        let request: WireguardPeerRequest = parse_request(payload)?;
        let key = BASE64_STANDARD
            .decode(&request.public_key)
            .map_err(|err| PeerServiceError::InvalidRequest(format!("invalid public key: {err}")))?;
        if key.len() != 32 {
            return Err(PeerServiceError::InvalidRequest(format!(
                "public key must be 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(request.public_key)
    }
}

impl V2RayPeerService {
    // simple, braced and urn forms all map to the lowercase hyphenated one
    fn derive_peer_id(payload: &[u8]) -> Result<String, PeerServiceError> {
        let request: V2RayPeerRequest = parse_request(payload)?;
        let uuid = Uuid::parse_str(&request.uuid).map_err(|err| {
            PeerServiceError::InvalidRequest(format!("invalid uuid {}: {err}", request.uuid))
        })?;
        Ok(uuid.hyphenated().to_string())
    }
}

impl OpenVpnPeerService {
    fn derive_peer_id(payload: &[u8]) -> Result<String, PeerServiceError> {
        let request: OpenVpnPeerRequest = parse_request(payload)?;
        let username = request.username.trim();
        if username.is_empty() {
            return Err(PeerServiceError::InvalidRequest(
                "username cannot be empty".into(),
            ));
        }
        Ok(username.to_string())
    }
}

/// Generates protocol services sharing the agent transport, and the enum over them.
macro_rules! peer_services {
    ($($variant:ident => $service:ident),* $(,)?) => {
        $(
            impl $service {
                #[must_use]
                pub fn new(agent: PeerAgent) -> Self {
                    Self { agent }
                }
            }

            impl PeerService for $service {
                fn service_type(&self) -> ServiceType {
                    ServiceType::$variant
                }

                fn peer_id(&self, payload: &[u8]) -> Result<String, PeerServiceError> {
                    Self::derive_peer_id(payload)
                }

                async fn add_peer(&self, payload: &[u8]) -> Result<AddedPeer, PeerServiceError> {
                    let peer_id = Self::derive_peer_id(payload)?;
                    let request: Value = parse_request(payload)?;
                    let data = self.agent.add_peer(&peer_id, &request).await?;
                    info!("Added {} peer {peer_id}", ServiceType::$variant);
                    Ok(AddedPeer { peer_id, data })
                }

                async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerServiceError> {
                    self.agent.remove_peer(peer_id).await
                }

                async fn has_peer(&self, peer_id: &str) -> Result<bool, PeerServiceError> {
                    self.agent.has_peer(peer_id).await
                }

                async fn peer_statistics(
                    &self,
                ) -> Result<HashMap<String, PeerStatistic>, PeerServiceError> {
                    self.agent.peer_statistics().await
                }

                async fn peer_count(&self) -> Result<usize, PeerServiceError> {
                    self.agent.peer_count().await
                }
            }
        )*

        /// Backend selected once at startup from the configured service type.
        #[derive(Clone, Debug)]
        pub enum PeerServiceClient {
            $($variant($service),)*
        }

        impl PeerServiceClient {
            pub fn new(
                service_type: ServiceType,
                agent_url: &str,
                timeout: Duration,
            ) -> Result<Self, PeerServiceError> {
                let agent = PeerAgent::new(agent_url, timeout)?;
                Ok(match service_type {
                    $(ServiceType::$variant => Self::$variant($service::new(agent)),)*
                })
            }
        }

        impl PeerService for PeerServiceClient {
            fn service_type(&self) -> ServiceType {
                match self {
                    $(Self::$variant(service) => service.service_type(),)*
                }
            }

            fn peer_id(&self, payload: &[u8]) -> Result<String, PeerServiceError> {
                match self {
                    $(Self::$variant(service) => service.peer_id(payload),)*
                }
            }

            async fn add_peer(&self, payload: &[u8]) -> Result<AddedPeer, PeerServiceError> {
                match self {
                    $(Self::$variant(service) => service.add_peer(payload).await,)*
                }
            }

            async fn remove_peer(&self, peer_id: &str) -> Result<(), PeerServiceError> {
                match self {
                    $(Self::$variant(service) => service.remove_peer(peer_id).await,)*
                }
            }

            async fn has_peer(&self, peer_id: &str) -> Result<bool, PeerServiceError> {
                match self {
                    $(Self::$variant(service) => service.has_peer(peer_id).await,)*
                }
            }

            async fn peer_statistics(
                &self,
            ) -> Result<HashMap<String, PeerStatistic>, PeerServiceError> {
                match self {
                    $(Self::$variant(service) => service.peer_statistics().await,)*
                }
            }

            async fn peer_count(&self) -> Result<usize, PeerServiceError> {
                match self {
                    $(Self::$variant(service) => service.peer_count().await,)*
                }
            }
        }
    };
}

peer_services!(
    Wireguard => WireguardPeerService,
    V2Ray => V2RayPeerService,
    OpenVpn => OpenVpnPeerService,
);

#[cfg(test)]
mod tests {
    use super::*;

    fn client(service_type: ServiceType) -> PeerServiceClient {
        PeerServiceClient::new(service_type, "http://127.0.0.1:1", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_wireguard_peer_id() {
        let service = client(ServiceType::Wireguard);
        assert_eq!(service.service_type(), ServiceType::Wireguard);
        let key = BASE64_STANDARD.encode([7u8; 32]);
        let payload = format!(r#"{{"public_key": "{key}"}}"#);
        assert_eq!(service.peer_id(payload.as_bytes()).unwrap(), key);

        let short = BASE64_STANDARD.encode([7u8; 16]);
        let payload = format!(r#"{{"public_key": "{short}"}}"#);
        assert!(matches!(
            service.peer_id(payload.as_bytes()),
            Err(PeerServiceError::InvalidRequest(_))
        ));
        assert!(service.peer_id(b"not json").is_err());
    }

    #[test]
    fn test_v2ray_peer_id() {
        let service = client(ServiceType::V2Ray);
        let payload = br#"{"uuid": "0D4C6E4A-9B3F-4E5A-8C1D-2F3E4A5B6C7D"}"#;
        assert_eq!(
            service.peer_id(payload).unwrap(),
            "0d4c6e4a-9b3f-4e5a-8c1d-2f3e4a5b6c7d"
        );
        for alias in [
            "0d4c6e4a9b3f4e5a8c1d2f3e4a5b6c7d",
            "{0d4c6e4a-9b3f-4e5a-8c1d-2f3e4a5b6c7d}",
            "urn:uuid:0D4C6E4A-9B3F-4E5A-8C1D-2F3E4A5B6C7D",
        ] {
            let payload = format!(r#"{{"uuid": "{alias}"}}"#);
            assert_eq!(
                service.peer_id(payload.as_bytes()).unwrap(),
                "0d4c6e4a-9b3f-4e5a-8c1d-2f3e4a5b6c7d"
            );
        }
        assert!(service.peer_id(br#"{"uuid": "not-a-uuid"}"#).is_err());
        assert!(
            service
                .peer_id(br#"{"uuid": "0d4c6e4a-9b3f-4e5a-8c1d-2f3e4a5b6c7"}"#)
                .is_err()
        );
        // wireguard payload is not accepted by a v2ray node
        assert!(service.peer_id(br#"{"public_key": "abc"}"#).is_err());
    }

    #[test]
    fn test_openvpn_peer_id() {
        let service = client(ServiceType::OpenVpn);
        assert_eq!(
            service.peer_id(br#"{"username": " client-42 "}"#).unwrap(),
            "client-42"
        );
        assert!(service.peer_id(br#"{"username": ""}"#).is_err());
    }
}
