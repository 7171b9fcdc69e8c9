//! gRPC client for the local leader elector.
//!
//! The elector listens on a unix socket and answers a single unary call,
//! `elector.v1.Elector/GetLeader`, with the current leader's id and whether
//! the caller is that leader. The two messages are small enough to declare by
//! hand with `prost` instead of generating them from a `.proto` file.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

use super::{ElectionError, LeaderElectionClient, LeaderStatus};

/// Full method path of the leader query.
pub const GET_LEADER_PATH: &str = "/elector.v1.Elector/GetLeader";

/// Request for the current leader. Carries no fields.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaderRequest {}

/// Current leader as seen by the elector.
#[derive(Clone, PartialEq, prost::Message)]
pub struct LeaderResponse {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(bool, tag = "2")]
    pub lead: bool,
}

/// Leader elector reached over a unix-domain socket.
pub struct GrpcElector {
    socket: PathBuf,
    channel: Mutex<Option<Channel>>,
    request_timeout: Duration,
}

impl GrpcElector {
    /// Dial the elector, failing if no connection is up within `connect_timeout`.
    pub async fn connect(
        socket: impl AsRef<Path>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, ElectionError> {
        let socket = socket.as_ref().to_path_buf();
        let path = socket.clone();

        // the authority is ignored; every connection goes to the socket
        let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(connect_timeout);
        let connecting = endpoint.connect_with_connector(service_fn(move |_: Uri| {
            UnixStream::connect(path.clone())
        }));

        let channel = tokio::time::timeout(connect_timeout, connecting)
            .await
            .map_err(|_| ElectionError::ConnectTimeout {
                socket: socket.clone(),
                timeout: connect_timeout,
            })?
            .map_err(|source| ElectionError::Connect {
                socket: socket.clone(),
                source,
            })?;

        info!(socket = %socket.display(), "Connected to leader elector");

        Ok(Self {
            socket,
            channel: Mutex::new(Some(channel)),
            request_timeout,
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn call(&self, channel: Channel) -> Result<LeaderResponse, ElectionError> {
        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("elector not ready: {}", e)))?;

        let codec: tonic::codec::ProstCodec<LeaderRequest, LeaderResponse> =
            tonic::codec::ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(LeaderRequest {}),
                PathAndQuery::from_static(GET_LEADER_PATH),
                codec,
            )
            .await?;

        Ok(response.into_inner())
    }
}

#[async_trait]
impl LeaderElectionClient for GrpcElector {
    async fn get_lead(&self) -> Result<LeaderStatus, ElectionError> {
        let channel = self.channel.lock().clone().ok_or(ElectionError::Closed)?;

        let response = tokio::time::timeout(self.request_timeout, self.call(channel))
            .await
            .map_err(|_| ElectionError::Timeout(self.request_timeout))??;

        debug!(leader = %response.id, lead = response.lead, "Leader election answer");
        Ok(LeaderStatus {
            id: response.id,
            is_lead: response.lead,
        })
    }

    async fn close(&self) -> Result<(), ElectionError> {
        if self.channel.lock().take().is_some() {
            info!(socket = %self.socket.display(), "Leader elector connection closed");
        }
        Ok(())
    }
}
