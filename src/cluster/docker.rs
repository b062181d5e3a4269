//! Docker Engine API client
//!
//! Talks to one engine endpoint of the swarm over HTTP(S) with reqwest. The
//! swarm endpoints (`/swarm`, `/nodes`, `/services`, `/tasks`) are only
//! answered by managers; image and container endpoints act on the engine's
//! own node, which is why callers connect to the node that ran a container
//! before committing it or reading its logs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use reqwest::{Certificate, Client, Identity, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::debug;

use super::addr::engine_base_url;
use super::client::{
    ClientConnector, ClusterClient, ClusterError, ClusterResult, EngineInfo, ImageInspect,
    InitRequest, JoinRequest, LogSink, SwarmInfo, TaskFilter,
};
use super::node::{Node, NodeSpec};
use super::service::{Service, ServiceSpec, Task};
use crate::config::SwarmConfig;

/// Engine API version every request is pinned to
pub const API_VERSION: &str = "v1.41";

/// Base64 of `{}`: the engine requires an auth header on push even without credentials
const EMPTY_REGISTRY_AUTH: &str = "e30=";

/// Certificates used for mutual TLS with the engines
#[derive(Clone)]
pub struct TlsMaterial {
    ca: Certificate,
    identity: Identity,
}

impl TlsMaterial {
    /// Read `ca.pem`, `cert.pem` and `key.pem` from a trust root directory
    pub fn load(root: &Path) -> ClusterResult<Self> {
        let ca_pem = std::fs::read(root.join("ca.pem"))?;
        let mut identity_pem = std::fs::read(root.join("cert.pem"))?;
        identity_pem.push(b'\n');
        identity_pem.extend(std::fs::read(root.join("key.pem"))?);

        let ca = Certificate::from_pem(&ca_pem).map_err(|e| ClusterError::Tls(e.to_string()))?;
        let identity =
            Identity::from_pem(&identity_pem).map_err(|e| ClusterError::Tls(e.to_string()))?;
        Ok(Self { ca, identity })
    }
}

/// Client for a single engine
pub struct DockerClient {
    address: String,
    base_url: String,
    http: Client,
    timeout: Duration,
}

impl DockerClient {
    /// Create a client for the engine at `address`
    pub fn new(address: &str, tls: Option<&TlsMaterial>, timeout: Duration) -> ClusterResult<Self> {
        let base_url = engine_base_url(address, tls.is_some())
            .ok_or_else(|| ClusterError::InvalidAddress(address.to_string()))?;

        let mut builder = Client::builder().connect_timeout(timeout);
        if let Some(tls) = tls {
            builder = builder
                .use_rustls_tls()
                .add_root_certificate(tls.ca.clone())
                .identity(tls.identity.clone());
        }
        let http = builder
            .build()
            .map_err(|e| ClusterError::Tls(e.to_string()))?;

        Ok(Self {
            address: address.to_string(),
            base_url,
            http,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}{}", self.base_url, API_VERSION, path)
    }

    /// Send a request and turn non-2xx answers into typed errors
    ///
    /// `target` names the entity a 404 refers to.
    async fn call(
        &self,
        op: &str,
        request: RequestBuilder,
        target: Option<(&str, &str)>,
    ) -> ClusterResult<Response> {
        debug!("{} -> {}", op, self.address);
        let response = request.send().await.map_err(|e| ClusterError::Transport {
            op: op.to_string(),
            source: e,
        })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(status_error(op, status, &body, target))
    }

    async fn decode<T: DeserializeOwned>(op: &str, response: Response) -> ClusterResult<T> {
        response.json::<T>().await.map_err(|e| ClusterError::Decode {
            op: op.to_string(),
            message: e.to_string(),
        })
    }
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "ID", alias = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

#[async_trait]
impl ClusterClient for DockerClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn info(&self) -> ClusterResult<EngineInfo> {
        let op = "info";
        let req = self.http.get(self.url("/info")).timeout(self.timeout);
        let resp = self.call(op, req, None).await?;
        Self::decode(op, resp).await
    }

    async fn init_swarm(&self, request: &InitRequest) -> ClusterResult<String> {
        let op = "init swarm";
        let req = self
            .http
            .post(self.url("/swarm/init"))
            .json(request)
            .timeout(self.timeout);
        let resp = self.call(op, req, None).await?;
        Self::decode::<String>(op, resp).await
    }

    async fn inspect_swarm(&self) -> ClusterResult<SwarmInfo> {
        let op = "inspect swarm";
        let req = self.http.get(self.url("/swarm")).timeout(self.timeout);
        let resp = self.call(op, req, None).await?;
        Self::decode(op, resp).await
    }

    async fn join_swarm(&self, request: &JoinRequest) -> ClusterResult<()> {
        let op = "join swarm";
        let req = self
            .http
            .post(self.url("/swarm/join"))
            .json(request)
            .timeout(self.timeout);
        self.call(op, req, None).await?;
        Ok(())
    }

    async fn list_nodes(&self) -> ClusterResult<Vec<Node>> {
        let op = "list nodes";
        let req = self.http.get(self.url("/nodes")).timeout(self.timeout);
        let resp = self.call(op, req, None).await?;
        Self::decode(op, resp).await
    }

    async fn inspect_node(&self, id: &str) -> ClusterResult<Node> {
        let op = "inspect node";
        let req = self
            .http
            .get(self.url(&format!("/nodes/{}", id)))
            .timeout(self.timeout);
        let resp = self.call(op, req, Some(("node", id))).await?;
        Self::decode(op, resp).await
    }

    async fn update_node(&self, id: &str, version: u64, spec: &NodeSpec) -> ClusterResult<()> {
        let op = "update node";
        let req = self
            .http
            .post(self.url(&format!("/nodes/{}/update", id)))
            .query(&[("version", version.to_string())])
            .json(spec)
            .timeout(self.timeout);
        self.call(op, req, Some(("node", id))).await?;
        Ok(())
    }

    async fn remove_node(&self, id: &str, force: bool) -> ClusterResult<()> {
        let op = "remove node";
        let req = self
            .http
            .delete(self.url(&format!("/nodes/{}", id)))
            .query(&[("force", force.to_string())])
            .timeout(self.timeout);
        self.call(op, req, Some(("node", id))).await?;
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> ClusterResult<String> {
        let op = "create service";
        let req = self
            .http
            .post(self.url("/services/create"))
            .json(spec)
            .timeout(self.timeout);
        let resp = self.call(op, req, None).await?;
        let created: IdResponse = Self::decode(op, resp).await?;
        Ok(created.id)
    }

    async fn inspect_service(&self, id_or_name: &str) -> ClusterResult<Service> {
        let op = "inspect service";
        let req = self
            .http
            .get(self.url(&format!("/services/{}", id_or_name)))
            .timeout(self.timeout);
        let resp = self.call(op, req, Some(("service", id_or_name))).await?;
        Self::decode(op, resp).await
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> ClusterResult<()> {
        let op = "update service";
        let req = self
            .http
            .post(self.url(&format!("/services/{}/update", id)))
            .query(&[("version", version.to_string())])
            .json(spec)
            .timeout(self.timeout);
        self.call(op, req, Some(("service", id))).await?;
        Ok(())
    }

    async fn remove_service(&self, id: &str) -> ClusterResult<()> {
        let op = "remove service";
        let req = self
            .http
            .delete(self.url(&format!("/services/{}", id)))
            .timeout(self.timeout);
        self.call(op, req, Some(("service", id))).await?;
        Ok(())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> ClusterResult<Vec<Task>> {
        let op = "list tasks";
        let req = self
            .http
            .get(self.url("/tasks"))
            .query(&[("filters", filter.to_query().to_string())])
            .timeout(self.timeout);
        let resp = self.call(op, req, None).await?;
        Self::decode(op, resp).await
    }

    async fn inspect_image(&self, image: &str) -> ClusterResult<ImageInspect> {
        let op = "inspect image";
        let req = self
            .http
            .get(self.url(&format!("/images/{}/json", image)))
            .timeout(self.timeout);
        let resp = self.call(op, req, Some(("image", image))).await?;
        Self::decode(op, resp).await
    }

    async fn commit_container(
        &self,
        container_id: &str,
        repo: &str,
        tag: &str,
    ) -> ClusterResult<String> {
        let op = "commit container";
        let req = self
            .http
            .post(self.url("/commit"))
            .query(&[("container", container_id), ("repo", repo), ("tag", tag)])
            .json(&serde_json::json!({}))
            .timeout(self.timeout);
        let resp = self.call(op, req, Some(("container", container_id))).await?;
        let committed: IdResponse = Self::decode(op, resp).await?;
        Ok(committed.id)
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> ClusterResult<()> {
        let op = "tag image";
        let req = self
            .http
            .post(self.url(&format!("/images/{}/tag", image)))
            .query(&[("repo", repo), ("tag", tag)])
            .timeout(self.timeout);
        self.call(op, req, Some(("image", image))).await?;
        Ok(())
    }

    async fn push_image(&self, repo: &str, tag: &str) -> ClusterResult<()> {
        let op = "push image";
        let req = self
            .http
            .post(self.url(&format!("/images/{}/push", repo)))
            .query(&[("tag", tag)])
            .header("X-Registry-Auth", EMPTY_REGISTRY_AUTH);
        let resp = self.call(op, req, Some(("image", repo))).await?;

        // Push failures arrive inside a 200 progress stream
        let body = resp.text().await.map_err(|e| ClusterError::Transport {
            op: op.to_string(),
            source: e,
        })?;
        match push_stream_error(&body) {
            Some(message) => Err(ClusterError::api(op, 200, message)),
            None => Ok(()),
        }
    }

    async fn container_logs(&self, container_id: &str, sink: LogSink<'_>) -> ClusterResult<()> {
        let op = "container logs";
        let req = self
            .http
            .get(self.url(&format!("/containers/{}/logs", container_id)))
            .query(&[("follow", "1"), ("stdout", "1"), ("stderr", "1")]);
        let resp = self.call(op, req, Some(("container", container_id))).await?;

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(stream);
        copy_multiplexed(&mut reader, sink).await?;
        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> ClusterResult<i64> {
        let op = "wait container";
        let req = self
            .http
            .post(self.url(&format!("/containers/{}/wait", container_id)));
        let resp = self.call(op, req, Some(("container", container_id))).await?;
        let waited: WaitResponse = Self::decode(op, resp).await?;
        Ok(waited.status_code)
    }
}

/// Connector that opens (and reuses) [`DockerClient`]s
pub struct DockerConnector {
    tls: Option<TlsMaterial>,
    timeout: Duration,
    clients: DashMap<String, Arc<DockerClient>>,
}

impl DockerConnector {
    pub fn new(tls: Option<TlsMaterial>, timeout: Duration) -> Self {
        Self {
            tls,
            timeout,
            clients: DashMap::new(),
        }
    }

    /// Build a connector from configuration, loading TLS material if configured
    pub fn from_config(config: &SwarmConfig) -> ClusterResult<Self> {
        let tls = match config.tls_root_path() {
            Some(root) => Some(TlsMaterial::load(&root)?),
            None => None,
        };
        Ok(Self::new(tls, config.request_timeout()))
    }
}

impl ClientConnector for DockerConnector {
    fn connect(&self, address: &str) -> ClusterResult<Arc<dyn ClusterClient>> {
        if let Some(client) = self.clients.get(address) {
            return Ok(client.clone());
        }
        let client = Arc::new(DockerClient::new(address, self.tls.as_ref(), self.timeout)?);
        self.clients.insert(address.to_string(), client.clone());
        Ok(client)
    }
}

// ============================================================================
// SBIO: Pure response handling (no I/O)
// ============================================================================

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Map a non-2xx engine answer to a [`ClusterError`]
pub fn status_error(op: &str, status: u16, body: &str, target: Option<(&str, &str)>) -> ClusterError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());

    if status == 404 {
        let (kind, id) = target.unwrap_or(("resource", ""));
        return ClusterError::not_found(op, kind, id);
    }
    if status == 409 || message.contains("update out of sequence") {
        return ClusterError::conflict(op, message);
    }
    ClusterError::api(op, status, message)
}

/// First error reported in an image push progress stream
pub fn push_stream_error(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .find_map(|msg| {
            msg.get("error")
                .and_then(|e| e.as_str())
                .map(|e| e.to_string())
        })
}

/// Copy an engine log stream into `sink`, stripping stream multiplexing headers
///
/// Each frame is `[stream, 0, 0, 0, len(4 bytes BE)]` followed by `len` bytes.
/// A stream that does not start with a valid header (TTY containers) is copied
/// verbatim.
pub async fn copy_multiplexed<R, W>(reader: &mut R, sink: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut copied = 0u64;
    let mut header = [0u8; 8];
    let mut first = true;

    loop {
        let read = read_full(reader, &mut header).await?;
        if read == 0 {
            break;
        }
        if read < header.len() || !is_frame_header(&header) {
            if first || read < header.len() {
                sink.write_all(&header[..read]).await?;
                copied += read as u64;
                copied += tokio::io::copy(reader, sink).await?;
                break;
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "malformed log stream frame",
            ));
        }
        first = false;

        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let mut frame = (&mut *reader).take(len);
        let n = tokio::io::copy(&mut frame, sink).await?;
        copied += n;
        if n < len {
            break;
        }
    }

    sink.flush().await?;
    Ok(copied)
}

fn is_frame_header(header: &[u8; 8]) -> bool {
    header[0] <= 2 && header[1] == 0 && header[2] == 0 && header[3] == 0
}

/// Read until `buf` is full or EOF; returns bytes read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
