use super::api::{CreateOptions, VolumeInfo};
use super::error::PluginError;
use async_trait::async_trait;
use std::path::PathBuf;

/// The verbs of the Docker volume protocol, minus transport concerns.
#[async_trait]
pub trait VolumeDriver: Send + Sync {
    async fn create(&self, name: &str, opts: CreateOptions) -> Result<(), PluginError>;
    async fn remove(&self, name: &str) -> Result<(), PluginError>;
    async fn mount(&self, name: &str, id: &str) -> Result<PathBuf, PluginError>;
    async fn unmount(&self, name: &str, id: &str) -> Result<(), PluginError>;
    async fn path(&self, name: &str) -> Result<PathBuf, PluginError>;
    async fn get(&self, name: &str) -> Result<VolumeInfo, PluginError>;
    async fn list(&self) -> Result<Vec<VolumeInfo>, PluginError>;
}
