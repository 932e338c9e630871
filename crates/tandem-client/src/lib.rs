//! Client side of a tandem call: REST calls, the signaling socket and the
//! per-party [`CallAgent`] that ties them to local media.

pub mod agent;
pub mod api;
pub mod config;
pub mod error;
pub mod signaling;

use std::sync::Arc;

use tandem_media::{MediaDevices, RtcEngineFactory, SystemDevices};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use agent::{AgentHandle, AgentNotice, AgentState, CallAgent, CallControl};
pub use api::ApiClient;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use signaling::SignalingClient;

/// Connect to the server and start an agent for the token's user,
/// capturing from the host's microphone and camera.
pub async fn connect(
    config: &ClientConfig,
) -> Result<(AgentHandle, mpsc::UnboundedReceiver<AgentNotice>, JoinHandle<()>)> {
    connect_with_devices(config, Arc::new(SystemDevices::new())).await
}

/// [`connect`] with a caller-supplied capture source.
pub async fn connect_with_devices(
    config: &ClientConfig,
    devices: Arc<dyn MediaDevices>,
) -> Result<(AgentHandle, mpsc::UnboundedReceiver<AgentNotice>, JoinHandle<()>)> {
    let user = config.user_id()?;
    let (signaling, events) = SignalingClient::connect(config).await?;

    let (agent, notices) = CallAgent::new(
        user,
        Arc::new(ApiClient::new(config)),
        Arc::new(signaling),
        devices,
        Arc::new(RtcEngineFactory::new(config.ice_servers.clone())),
    );
    let (handle, task) = agent
        .with_negotiation_timeout(config.negotiation_timeout)
        .spawn(events);
    Ok((handle, notices, task))
}
