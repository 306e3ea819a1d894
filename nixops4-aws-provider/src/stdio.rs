use crate::{CloudProvider, Output, Params, ProviderError};
use anyhow::{Context, Result};
use futures_util::{SinkExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio::{
    process::{Child, ChildStdin, ChildStdout},
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

pub struct StdioProviderConfig {
    pub executable: String,
    pub args: Vec<String>,
}

/// A provider implemented by a long-lived subprocess.
///
/// Requests and responses are single JSON lines on the child's stdin and
/// stdout; stderr is inherited. One request is in flight at a time.
///
/// ```text
/// > {"id":1,"operation":"ec2:CreateVpc","parameters":{"Region":"us-east-1"}}
/// < {"id":1,"result":{"vpcId":"vpc-123"}}
/// < {"id":2,"error":{"code":"InvalidVpcID.NotFound","message":"..."}}
/// ```
pub struct StdioProvider {
    executable: String,
    channel: Mutex<Option<Channel>>,
}

struct Channel {
    child: Child,
    writer: FramedWrite<ChildStdin, LinesCodec>,
    reader: FramedRead<ChildStdout, LinesCodec>,
    next_id: u64,
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    operation: &'a str,
    parameters: &'a Params,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Output>,
    #[serde(default)]
    error: Option<ProviderError>,
}

impl StdioProvider {
    pub fn launch(config: StdioProviderConfig) -> Result<Self> {
        let mut child = tokio::process::Command::new(&config.executable)
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Could not spawn provider process {}", config.executable))?;
        let stdin = child
            .stdin
            .take()
            .context("provider process has no stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("provider process has no stdout")?;
        Ok(StdioProvider {
            executable: config.executable,
            channel: Mutex::new(Some(Channel {
                child,
                writer: FramedWrite::new(stdin, LinesCodec::new()),
                reader: FramedRead::new(stdout, LinesCodec::new()),
                next_id: 0,
            })),
        })
    }

    /// Close the provider's stdin and wait for it to exit.
    pub async fn close_wait(&self) -> Result<()> {
        let channel = self.channel.lock().await.take();
        if let Some(Channel {
            mut child, writer, ..
        }) = channel
        {
            drop(writer);
            let status = child
                .wait()
                .await
                .with_context(|| format!("waiting for provider process {}", self.executable))?;
            if !status.success() {
                anyhow::bail!("provider process {} exited with {}", self.executable, status);
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CloudProvider for StdioProvider {
    async fn invoke(&self, operation: &str, params: Params) -> Result<Output, ProviderError> {
        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| ProviderError::transport("provider process was closed"))?;
        channel.next_id += 1;
        let id = channel.next_id;

        let line = serde_json::to_string(&Request {
            id,
            operation,
            parameters: &params,
        })
        .map_err(|e| ProviderError::transport(format!("could not encode request: {}", e)))?;
        tracing::trace!(id, operation, "sending provider request");
        channel.writer.send(line).await.map_err(|e| {
            ProviderError::transport(format!("could not write to provider process: {}", e))
        })?;

        let response_line = channel
            .reader
            .next()
            .await
            .ok_or_else(|| ProviderError::transport("provider process closed its output"))?
            .map_err(|e| {
                ProviderError::transport(format!("could not read from provider process: {}", e))
            })?;
        let response: Response = serde_json::from_str(&response_line).map_err(|e| {
            ProviderError::transport(format!("invalid response from provider process: {}", e))
        })?;
        if response.id != id {
            return Err(ProviderError::transport(format!(
                "response id {} does not match request id {}",
                response.id, id
            )));
        }
        match (response.result, response.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Output::new()),
        }
    }
}
