use crate::name::NameError;
use crate::rbd::BlockError;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode, body::Bytes};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error(transparent)]
    Name(#[from] NameError),

    #[error("Ceph RBD Image not found: {0}")]
    NotFound(String),

    #[error("unable to lock image {pool}/{image}: {source}")]
    LockDenied {
        pool: String,
        image: String,
        #[source]
        source: BlockError,
    },

    #[error("unable to map image {pool}/{image}: {source}")]
    MapFailed {
        pool: String,
        image: String,
        #[source]
        source: BlockError,
    },

    #[error("filesystem on {dev} failed verification: {source}", dev = .device.display())]
    FsCorrupt {
        device: PathBuf,
        #[source]
        source: BlockError,
    },

    #[error("unable to create mountpoint {mountpoint}: {source}", mountpoint = .path.display())]
    MountPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to mount {dev} at {mountpoint}: {source}", dev = .device.display(), mountpoint = .path.display())]
    MountFailed {
        device: PathBuf,
        path: PathBuf,
        #[source]
        source: BlockError,
    },

    /// The device is still open inside a container; teardown was aborted.
    #[error("device {device} is busy, volume still in use", device = .0.display())]
    Busy(PathBuf),

    #[error("teardown incomplete: {0}")]
    Teardown(String),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct DockerErrorResponse {
    #[serde(rename = "Err")]
    err: String,
}

impl PluginError {
    /// Encode this error the way the protocol reports failure: HTTP 500
    /// with the message in the `Err` field.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let err = self.to_string();
        tracing::error!(error = %err, "plugin request failed");

        let body = serde_json::to_vec(&DockerErrorResponse { err })
            .unwrap_or_else(|_| br#"{"Err":"error encoding failed"}"#.to_vec());

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}
