//! Kubelet pod-resources client: hand-written prost messages for the
//! `v1alpha1.PodResourcesLister/List` method, called over the kubelet's
//! Unix domain socket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Endpoint, Uri};
use tower::service_fn;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPodResourcesRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListPodResourcesResponse {
    #[prost(message, repeated, tag = "1")]
    pub pod_resources: Vec<PodResources>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PodResources {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub namespace: String,
    #[prost(message, repeated, tag = "3")]
    pub containers: Vec<ContainerResources>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerResources {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub devices: Vec<ContainerDevices>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ContainerDevices {
    #[prost(string, tag = "1")]
    pub resource_name: String,
    #[prost(string, repeated, tag = "2")]
    pub device_ids: Vec<String>,
}

/// Source of pod-resources listings; mocked in tests.
#[async_trait]
pub trait PodResourcesLister: Send + Sync {
    async fn list(&self) -> Result<Vec<PodResources>>;
}

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PodResourcesClient {
    socket_path: PathBuf,
}

impl PodResourcesClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

#[async_trait]
impl PodResourcesLister for PodResourcesClient {
    async fn list(&self) -> Result<Vec<PodResources>> {
        let socket_path = self.socket_path.clone();

        // The URI is required by the endpoint builder but unused: the
        // connector dials the Unix socket directly.
        let channel = Endpoint::try_from("http://[::]:50051")?
            .timeout(LIST_TIMEOUT)
            .connect_timeout(LIST_TIMEOUT)
            .connect_with_connector(service_fn(move |_: Uri| {
                let socket_path = socket_path.clone();
                async move {
                    Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket_path).await?))
                }
            }))
            .await
            .map_err(|e| anyhow!("could not connect to pod-resources socket: {e}"))?;

        let mut grpc = tonic::client::Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| anyhow!("pod-resources service not ready: {e}"))?;

        let codec: tonic::codec::ProstCodec<ListPodResourcesRequest, ListPodResourcesResponse> =
            tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static("/v1alpha1.PodResourcesLister/List");

        let response = grpc
            .unary(
                tonic::Request::new(ListPodResourcesRequest::default()),
                path,
                codec,
            )
            .await
            .map_err(|status| anyhow!("pod-resources List failed: {status}"))?;

        Ok(response.into_inner().pod_resources)
    }
}
