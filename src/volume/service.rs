use crate::volume::api::{
    Capabilities, CapabilitiesResponse, CreateRequest, ErrResponse, GetResponse, ListResponse,
    MountRequest, MountResponse, NameRequest, PluginActivateResponse,
};
use crate::volume::driver::VolumeDriver;
use crate::volume::error::PluginError;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderValue};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// Serves the Docker plugin protocol: each verb is a POST of a small JSON
/// document to a well-known path, answered with a JSON document whose
/// `Err` field is empty on success.
#[derive(Clone)]
pub struct DockerPluginService {
    driver: Arc<dyn VolumeDriver>,
}

impl DockerPluginService {
    pub fn new(driver: Arc<dyn VolumeDriver>) -> Self {
        Self { driver }
    }

    /// Handle one verb against the driver.
    ///
    /// Returns the serialized response body, or `Ok(None)` when the path
    /// is not part of the protocol. Errors become the `{"Err": …}`
    /// envelope in [`Service::call`].
    async fn dispatch(&self, verb: &str, payload: &[u8]) -> Result<Option<Vec<u8>>, PluginError> {
        match verb {
            "/Plugin.Activate" => json_body(&PluginActivateResponse {
                implements: vec!["VolumeDriver".to_string()],
            }),
            "/VolumeDriver.Capabilities" => json_body(&CapabilitiesResponse {
                capabilities: Capabilities {
                    scope: "global".into(),
                },
            }),
            "/VolumeDriver.Create" => {
                let req: CreateRequest = request(payload)?;
                info!(volume = %req.name, "create requested");
                self.driver
                    .create(&req.name, req.opts.unwrap_or_default())
                    .await?;
                json_body(&ErrResponse { err: String::new() })
            }
            "/VolumeDriver.Remove" => {
                let req: NameRequest = request(payload)?;
                info!(volume = %req.name, "remove requested");
                self.driver.remove(&req.name).await?;
                json_body(&ErrResponse { err: String::new() })
            }
            "/VolumeDriver.Mount" => {
                let req: MountRequest = request(payload)?;
                info!(volume = %req.name, client = %req.id, "mount requested");
                let mountpoint = self.driver.mount(&req.name, &req.id).await?;
                json_body(&MountResponse {
                    mountpoint: mountpoint.display().to_string(),
                    err: String::new(),
                })
            }
            "/VolumeDriver.Unmount" => {
                let req: MountRequest = request(payload)?;
                info!(volume = %req.name, client = %req.id, "unmount requested");
                self.driver.unmount(&req.name, &req.id).await?;
                json_body(&ErrResponse { err: String::new() })
            }
            "/VolumeDriver.Path" => {
                let req: NameRequest = request(payload)?;
                let mountpoint = self.driver.path(&req.name).await?;
                json_body(&MountResponse {
                    mountpoint: mountpoint.display().to_string(),
                    err: String::new(),
                })
            }
            "/VolumeDriver.Get" => {
                let req: NameRequest = request(payload)?;
                let volume = self.driver.get(&req.name).await?;
                json_body(&GetResponse {
                    volume,
                    err: String::new(),
                })
            }
            "/VolumeDriver.List" => {
                let volumes = self.driver.list().await?;
                json_body(&ListResponse {
                    volumes,
                    err: String::new(),
                })
            }
            _ => Ok(None),
        }
    }
}

impl Service<Request<Incoming>> for DockerPluginService {
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move {
            let verb = req.uri().path().to_owned();
            debug!(method = %req.method(), %verb, "incoming plugin request");

            // Every protocol verb fits in one small body; read it up
            // front so dispatch works on plain bytes.
            let payload = match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    let err = PluginError::Internal(format!("failed to read request body: {e}"));
                    return Ok(err.into_response());
                }
            };

            let response = match service.dispatch(&verb, &payload).await {
                Ok(Some(body)) => json_response(StatusCode::OK, body),
                Ok(None) => json_response(StatusCode::NOT_FOUND, Vec::new()),
                Err(e) => e.into_response(),
            };
            Ok(response)
        })
    }
}

fn request<T: DeserializeOwned>(payload: &[u8]) -> Result<T, PluginError> {
    serde_json::from_slice(payload).map_err(PluginError::Json)
}

fn json_body<T: Serialize>(body: &T) -> Result<Option<Vec<u8>>, PluginError> {
    Ok(Some(serde_json::to_vec(body)?))
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
