//! Protocol client.
//!
//! One request in flight at a time over a single connection. Every request
//! carries a fresh numeric correlation id which the response must echo.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::Instant;
use tracing::debug;

use vcs_models::{ErrorKind, JobId, JobSnapshot, Request, Response};

use crate::config::ClientConfig;
use crate::frame::{read_frame, write_frame, Frame, FrameError};

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Server error ({kind}): {message}")]
    Server { kind: ErrorKind, message: String },

    #[error("Timed out after {waited:?} waiting for job {job_id}")]
    Timeout { job_id: JobId, waited: Duration },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Connection closed by server")]
    ConnectionClosed,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Error kind reported by the server, if this is a server error.
    pub fn server_kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Server { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// A downloaded job output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub job_id: JobId,
    /// Output file extension
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Client for the MMP gateway.
pub struct VcsClient {
    stream: TcpStream,
    config: ClientConfig,
    next_id: u64,
}

impl VcsClient {
    pub async fn connect(addr: impl ToSocketAddrs, config: ClientConfig) -> ClientResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            config,
            next_id: 1,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Submit a job with the video attached as the frame payload.
    pub async fn submit(
        &mut self,
        operation: &str,
        parameters: Value,
        media_type: &str,
        video: Vec<u8>,
    ) -> ClientResult<JobId> {
        let id = self.next_id();
        let request = Request::submit(id, operation, parameters);
        let (response, _) = self.call(request, Some((media_type, video))).await?;
        accepted(response)
    }

    /// Upload a local file. Its extension becomes the media type.
    pub async fn submit_file(
        &mut self,
        path: impl AsRef<Path>,
        operation: &str,
        parameters: Value,
    ) -> ClientResult<JobId> {
        let path = path.as_ref();
        let video = tokio::fs::read(path).await?;
        let media_type = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("bin")
            .to_string();
        self.submit(operation, parameters, &media_type, video).await
    }

    /// Submit a job whose input already lives on the server.
    pub async fn submit_source(
        &mut self,
        source: impl AsRef<Path>,
        operation: &str,
        parameters: Value,
    ) -> ClientResult<JobId> {
        let mut parameters = match parameters {
            Value::Null => json!({}),
            Value::Object(map) => Value::Object(map),
            other => {
                return Err(ClientError::InvalidRequest(format!(
                    "parameters must be an object, got {other}"
                )))
            }
        };
        parameters["source"] = json!(source.as_ref());

        let id = self.next_id();
        let request = Request::submit(id, operation, parameters);
        let (response, _) = self.call(request, None).await?;
        accepted(response)
    }

    pub async fn status(&mut self, job_id: &JobId) -> ClientResult<JobSnapshot> {
        let id = self.next_id();
        let (response, _) = self.call(Request::status(id, job_id.clone()), None).await?;

        match response {
            Response::Status {
                job_id,
                state,
                progress_percent,
                error_detail,
                output_location,
                ..
            } => Ok(JobSnapshot {
                job_id,
                state,
                progress_percent,
                error_detail,
                output_location,
            }),
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub async fn download(&mut self, job_id: &JobId) -> ClientResult<Download> {
        let id = self.next_id();
        let (response, frame) = self
            .call(Request::download(id, job_id.clone()), None)
            .await?;

        match response {
            Response::Download { job_id, size, .. } => {
                if frame.payload.len() as u64 != size {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "announced {size} bytes, received {}",
                        frame.payload.len()
                    )));
                }
                Ok(Download {
                    job_id,
                    media_type: frame.media_type,
                    bytes: frame.payload,
                })
            }
            other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    /// Poll status every `check_interval` until the job is terminal.
    ///
    /// Fails with [`ClientError::Timeout`] once `max_wait` has passed; the job
    /// itself is left alone.
    pub async fn wait_for_completion(&mut self, job_id: &JobId) -> ClientResult<JobSnapshot> {
        let started = Instant::now();

        loop {
            let snapshot = self.status(job_id).await?;
            if snapshot.state.is_terminal() {
                return Ok(snapshot);
            }

            let waited = started.elapsed();
            if waited >= self.config.max_wait {
                return Err(ClientError::Timeout {
                    job_id: job_id.clone(),
                    waited,
                });
            }

            debug!(
                job_id = %job_id,
                state = %snapshot.state,
                progress = snapshot.progress_percent,
                "Waiting for job"
            );
            let remaining = self.config.max_wait - waited;
            tokio::time::sleep(self.config.check_interval.min(remaining)).await;
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send one request and read its response frame.
    async fn call(
        &mut self,
        request: Request,
        attachment: Option<(&str, Vec<u8>)>,
    ) -> ClientResult<(Response, Frame)> {
        let id = request.id().clone();

        let mut frame = Frame::from_message(&request)?;
        if let Some((media_type, payload)) = attachment {
            frame = frame.with_payload(media_type, payload);
        }
        write_frame(&mut self.stream, &frame).await?;

        let reply = read_frame(&mut self.stream, self.config.max_download_bytes)
            .await?
            .ok_or(ClientError::ConnectionClosed)?;
        let response: Response = reply.message()?;

        if let Response::Error { error, .. } = response {
            return Err(ClientError::Server {
                kind: error.kind,
                message: error.message,
            });
        }
        if response.id() != &id {
            return Err(ClientError::UnexpectedResponse(format!(
                "response id {} does not match request id {}",
                response.id(),
                id
            )));
        }

        Ok((response, reply))
    }
}

fn accepted(response: Response) -> ClientResult<JobId> {
    match response {
        Response::Accepted { job_id, .. } => Ok(job_id),
        other => Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use vcs_models::JobState;

    /// Answers every status request with the given state.
    async fn fake_server(state: JobState) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            while let Ok(Some(frame)) = read_frame(&mut stream, 0).await {
                let request: Request = frame.message().unwrap();
                let Request::Status { id, job_id } = request else {
                    panic!("unexpected request");
                };
                let response = Response::status(
                    id,
                    JobSnapshot {
                        job_id,
                        state,
                        progress_percent: 0,
                        error_detail: None,
                        output_location: None,
                    },
                );
                write_frame(&mut stream, &Frame::from_message(&response).unwrap())
                    .await
                    .unwrap();
            }
        });

        addr
    }

    fn config(check_ms: u64, max_wait_ms: u64) -> ClientConfig {
        ClientConfig {
            check_interval: Duration::from_millis(check_ms),
            max_wait: Duration::from_millis(max_wait_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_wait_times_out_locally() {
        let addr = fake_server(JobState::Queued).await;
        let mut client = VcsClient::connect(addr, config(10, 60)).await.unwrap();

        let err = client
            .wait_for_completion(&JobId::from_string("slow"))
            .await
            .unwrap_err();
        match err {
            ClientError::Timeout { job_id, waited } => {
                assert_eq!(job_id.as_str(), "slow");
                assert!(waited >= Duration::from_millis(60));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_snapshot() {
        let addr = fake_server(JobState::Failed).await;
        let mut client = VcsClient::connect(addr, config(10, 1000)).await.unwrap();

        let snapshot = client
            .wait_for_completion(&JobId::from_string("done"))
            .await
            .unwrap();
        assert_eq!(snapshot.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_submit_source_requires_object_parameters() {
        let addr = fake_server(JobState::Queued).await;
        let mut client = VcsClient::connect(addr, config(10, 10)).await.unwrap();

        let err = client
            .submit_source("/data/in.mp4", "compress", json!([1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidRequest(_)));
    }
}
