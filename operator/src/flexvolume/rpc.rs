//! Wire protocol between the driver binary and the node agent.
//!
//! Each request and response is one JSON document on its own line. A connection may carry any
//! number of calls, answered in order.
use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixStream,
    },
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    flexvolume::{
        AttachOptions, ClientAccessInfo, ExpandArgs, GlobalMountPathInput, LogMessage,
        VolumeController,
    },
};

/// Arguments of GetAttachInfoFromMountDir.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountDirArgs {
    /// Pod scoped mount point
    pub mount_dir: String,
    /// Options known so far
    pub options: AttachOptions,
}

/// A call from the driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
#[allow(missing_docs)]
pub enum Request {
    Attach(AttachOptions),
    Detach(AttachOptions),
    DetachForce(AttachOptions),
    RemoveAttachmentObject(AttachOptions),
    GetAttachInfoFromMountDir(MountDirArgs),
    GetGlobalMountPath(GlobalMountPathInput),
    /// Cluster namespace, pod namespace, mount user and mount secret.
    GetClientAccessInfo([String; 4]),
    GetKernelVersion,
    Expand(ExpandArgs),
    Log(LogMessage),
}

impl Request {
    /// Name of the remote method.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Attach(_) => "Attach",
            Request::Detach(_) => "Detach",
            Request::DetachForce(_) => "DetachForce",
            Request::RemoveAttachmentObject(_) => "RemoveAttachmentObject",
            Request::GetAttachInfoFromMountDir(_) => "GetAttachInfoFromMountDir",
            Request::GetGlobalMountPath(_) => "GetGlobalMountPath",
            Request::GetClientAccessInfo(_) => "GetClientAccessInfo",
            Request::GetKernelVersion => "GetKernelVersion",
            Request::Expand(_) => "Expand",
            Request::Log(_) => "Log",
        }
    }
}

/// Outcome of a call. Exactly one of the fields is set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Return value, null for calls without one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure, prefixed with the method name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    fn ok(value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => Response {
                result: Some(value),
                error: None,
            },
            Err(err) => Response::error(format!("failed to encode result: {err}")),
        }
    }

    fn error(message: String) -> Self {
        Response {
            result: None,
            error: Some(message),
        }
    }
}

/// Run `request` against `controller`.
pub async fn dispatch<C>(controller: &C, request: Request) -> Response
where
    C: VolumeController + ?Sized,
{
    let method = request.method();
    let res = match request {
        Request::Attach(opts) => controller.attach(&opts).await.map(Response::ok),
        Request::Detach(opts) => controller.detach(&opts).await.map(Response::ok),
        Request::DetachForce(opts) => controller.detach_force(&opts).await.map(Response::ok),
        Request::RemoveAttachmentObject(opts) => controller
            .remove_attachment_object(&opts)
            .await
            .map(Response::ok),
        Request::GetAttachInfoFromMountDir(args) => controller
            .get_attach_info_from_mount_dir(&args.mount_dir, args.options)
            .await
            .map(Response::ok),
        Request::GetGlobalMountPath(input) => controller
            .get_global_mount_path(&input)
            .await
            .map(Response::ok),
        Request::GetClientAccessInfo([cluster_namespace, pod_namespace, user, secret]) => {
            controller
                .get_client_access_info(&cluster_namespace, &pod_namespace, &user, &secret)
                .await
                .map(Response::ok)
        }
        Request::GetKernelVersion => controller.get_kernel_version().await.map(Response::ok),
        Request::Expand(args) => controller.expand(&args).await.map(Response::ok),
        Request::Log(message) => controller.log(&message).await.map(Response::ok),
    };
    res.unwrap_or_else(|err| {
        warn!(method, %err, "call failed");
        Response::error(format!("{method}: {err}"))
    })
}

/// Answer calls on `stream` until the peer closes it.
pub async fn serve_connection<C>(controller: Arc<C>, stream: UnixStream) -> anyhow::Result<()>
where
    C: VolumeController + ?Sized,
{
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                debug!(method = request.method(), "dispatching call");
                dispatch(controller.as_ref(), request).await
            }
            Err(err) => Response::error(format!("invalid request: {err}")),
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        write.write_all(&out).await?;
    }
    Ok(())
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

/// Client side of the protocol, used by the driver binary.
pub struct RpcClient {
    conn: Mutex<Connection>,
}

impl RpcClient {
    /// Connect to the agent listening on `socket`.
    pub async fn connect(socket: impl AsRef<Path>) -> anyhow::Result<Self> {
        let socket = socket.as_ref();
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("failed to connect to {}", socket.display()))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            conn: Mutex::new(Connection {
                lines: BufReader::new(read).lines(),
                write,
            }),
        })
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let method = request.method();
        let mut out = serde_json::to_vec(&request).map_err(anyhow::Error::from)?;
        out.push(b'\n');

        let mut conn = self.conn.lock().await;
        conn.write
            .write_all(&out)
            .await
            .with_context(|| format!("failed to send {method}"))?;
        let line = conn
            .lines
            .next_line()
            .await
            .with_context(|| format!("failed to read {method} response"))?
            .ok_or_else(|| anyhow!("connection closed before {method} returned"))?;
        let response: Response = serde_json::from_str(&line)
            .with_context(|| format!("malformed {method} response"))?;
        if let Some(message) = response.error {
            return Err(Error::App {
                source: anyhow!(message),
            });
        }
        let value = response.result.unwrap_or(Value::Null);
        Ok(serde_json::from_value(value)
            .with_context(|| format!("unexpected {method} result"))?)
    }
}

#[async_trait]
impl VolumeController for RpcClient {
    async fn attach(&self, opts: &AttachOptions) -> Result<String> {
        self.call(Request::Attach(opts.clone())).await
    }

    async fn detach(&self, opts: &AttachOptions) -> Result<()> {
        self.call(Request::Detach(opts.clone())).await
    }

    async fn detach_force(&self, opts: &AttachOptions) -> Result<()> {
        self.call(Request::DetachForce(opts.clone())).await
    }

    async fn remove_attachment_object(&self, opts: &AttachOptions) -> Result<bool> {
        self.call(Request::RemoveAttachmentObject(opts.clone()))
            .await
    }

    async fn get_attach_info_from_mount_dir(
        &self,
        mount_dir: &str,
        opts: AttachOptions,
    ) -> Result<AttachOptions> {
        self.call(Request::GetAttachInfoFromMountDir(MountDirArgs {
            mount_dir: mount_dir.to_owned(),
            options: opts,
        }))
        .await
    }

    async fn get_global_mount_path(&self, input: &GlobalMountPathInput) -> Result<String> {
        self.call(Request::GetGlobalMountPath(input.clone())).await
    }

    async fn get_client_access_info(
        &self,
        cluster_namespace: &str,
        pod_namespace: &str,
        mount_user: &str,
        mount_secret: &str,
    ) -> Result<ClientAccessInfo> {
        self.call(Request::GetClientAccessInfo([
            cluster_namespace.to_owned(),
            pod_namespace.to_owned(),
            mount_user.to_owned(),
            mount_secret.to_owned(),
        ]))
        .await
    }

    async fn get_kernel_version(&self) -> Result<String> {
        self.call(Request::GetKernelVersion).await
    }

    async fn expand(&self, args: &ExpandArgs) -> Result<()> {
        self.call(Request::Expand(args.clone())).await
    }

    async fn log(&self, message: &LogMessage) -> Result<()> {
        self.call(Request::Log(message.clone())).await
    }
}
