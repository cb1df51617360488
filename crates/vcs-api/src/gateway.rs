//! Request handling.
//!
//! [`Gateway::receive`] streams an attached payload into the uploads
//! directory as it comes off the socket. [`Gateway::handle`] turns the request
//! into one response frame. Protocol errors become `BadRequest` responses so
//! the connection stays usable.

use std::net::SocketAddr;
use std::time::Instant;

use serde_json::Value;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use vcs_models::{CorrelationId, JobId, JobSnapshot, Request, Response};
use vcs_storage::{StagedInput, StorageError};

use crate::error::{ApiError, ApiResult};
use crate::frame::{Frame, FrameHead};
use crate::metrics;
use crate::state::AppState;

/// A request whose payload, if any, is already staged on disk.
#[derive(Debug)]
pub struct Inbound {
    pub json: Vec<u8>,
    pub upload: Option<StagedInput>,
}

/// Handles decoded frames against the registry.
#[derive(Clone)]
pub struct Gateway {
    state: AppState,
}

impl Gateway {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Finish reading a frame, staging its payload.
    ///
    /// On error the stream position is unknown and the connection must be
    /// closed.
    pub async fn receive<R>(&self, head: FrameHead, reader: &mut R) -> ApiResult<Inbound>
    where
        R: AsyncRead + Unpin,
    {
        if head.payload_len == 0 {
            return Ok(Inbound {
                json: head.json,
                upload: None,
            });
        }

        let extension = if head.media_type.is_empty() {
            "bin"
        } else {
            head.media_type.as_str()
        };
        let staged = self
            .state
            .workspace
            .stage_stream(reader, head.payload_len, extension)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to stage upload");
                ApiError::from(e)
            })?;

        metrics::record_upload(staged.bytes);
        Ok(Inbound {
            json: head.json,
            upload: Some(staged),
        })
    }

    /// Answer one request.
    pub async fn handle(&self, peer: SocketAddr, inbound: Inbound) -> Frame {
        let started = Instant::now();
        let Inbound { json, upload } = inbound;

        let raw: Value = match serde_json::from_slice(&json) {
            Ok(value) => value,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Undecodable request JSON");
                self.discard(upload).await;
                let err = ApiError::bad_request(format!("invalid JSON: {e}"));
                metrics::record_request("unknown", Some(err.kind()), started.elapsed());
                return error_frame(Value::Null, &err);
            }
        };
        let id = raw.get("id").cloned().unwrap_or(Value::Null);

        let request: Request = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Unknown or malformed request");
                self.discard(upload).await;
                let err = ApiError::bad_request(format!("unrecognized request: {e}"));
                metrics::record_request("unknown", Some(err.kind()), started.elapsed());
                return error_frame(id, &err);
            }
        };

        let method = request.method();
        let result = match request {
            Request::Submit {
                id: request_id,
                operation,
                parameters,
            } => self
                .submit(peer, &operation, &parameters, upload)
                .await
                .map(|job_id| response_frame(&Response::accepted(request_id, job_id))),
            Request::Status {
                id: request_id,
                job_id,
            } => {
                self.discard(upload).await;
                self.status(&job_id)
                    .map(|snapshot| response_frame(&Response::status(request_id, snapshot)))
            }
            Request::Download {
                id: request_id,
                job_id,
            } => {
                self.discard(upload).await;
                let output = self.download(&job_id).await;
                output.map(|(size, output)| {
                    response_frame(&Response::download(request_id, job_id, size))
                        .with_payload(output.media_type, output.payload)
                })
            }
        };

        match result {
            Ok(response) => {
                metrics::record_request(method, None, started.elapsed());
                response
            }
            Err(err) => {
                metrics::record_request(method, Some(err.kind()), started.elapsed());
                error_frame(id, &err)
            }
        }
    }

    async fn submit(
        &self,
        peer: SocketAddr,
        operation: &str,
        parameters: &Value,
        upload: Option<StagedInput>,
    ) -> ApiResult<JobId> {
        let staged = self.stage_input(parameters, upload).await?;

        match self
            .state
            .admission
            .admit(peer, operation, parameters, &staged)
        {
            Ok(job_id) => {
                info!(
                    job_id = %job_id,
                    client = %peer.ip(),
                    operation,
                    input_bytes = staged.bytes,
                    "Job admitted"
                );
                Ok(job_id)
            }
            Err(e) => {
                info!(client = %peer.ip(), operation, kind = %e.kind(), "Job rejected: {}", e);
                self.state.workspace.discard_staged(&staged).await;
                Err(e.into())
            }
        }
    }

    /// The staged upload, or the file named by `parameters.source`.
    async fn stage_input(
        &self,
        parameters: &Value,
        upload: Option<StagedInput>,
    ) -> ApiResult<StagedInput> {
        if let Some(staged) = upload {
            return Ok(staged);
        }

        match parameters.get("source").and_then(Value::as_str) {
            Some(source) => self
                .state
                .workspace
                .existing_source(source)
                .await
                .map_err(|e| match e {
                    StorageError::InvalidPath(msg) => ApiError::validation(msg),
                    other => ApiError::from(other),
                }),
            None => Err(ApiError::validation(
                "an input video payload or parameters.source is required",
            )),
        }
    }

    async fn discard(&self, upload: Option<StagedInput>) {
        if let Some(staged) = upload {
            self.state.workspace.discard_staged(&staged).await;
        }
    }

    fn status(&self, job_id: &JobId) -> ApiResult<JobSnapshot> {
        Ok(self.state.registry.status_of(job_id)?)
    }

    /// Output size and a frame carrying the output bytes.
    async fn download(&self, job_id: &JobId) -> ApiResult<(u64, Frame)> {
        let (path, operation) = self.state.registry.output_of(job_id)?;

        let payload = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(job_id = %job_id, path = %path.display(), "Output missing on disk");
                return Err(ApiError::NotFound(job_id.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if payload.len() as u64 > self.state.config.max_upload_bytes {
            return Err(ApiError::internal("output exceeds the frame size limit"));
        }

        metrics::record_download(payload.len());
        let size = payload.len() as u64;
        Ok((
            size,
            Frame::default().with_payload(operation.output_extension(), payload),
        ))
    }
}

fn response_frame(response: &Response) -> Frame {
    match Frame::from_message(response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to serialize response");
            Frame::new(br#"{"id":null,"error":{"kind":"Internal","message":"serialization failed"}}"#.to_vec())
        }
    }
}

/// Error response echoing the request's correlation id.
pub fn error_frame(id: CorrelationId, err: &ApiError) -> Frame {
    response_frame(&Response::error(id, err.kind(), err.client_message()))
}
