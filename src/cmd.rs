//! CLI entry point and subcommand dispatch.
//!
//! This module defines the top-level `rbdvol` command-line interface.
//! The only subcommand is `serve`, which runs the plugin daemon.

use clap::{Parser, Subcommand};

mod serve;

pub use serve::serve;

#[derive(Parser, Debug)]
#[command(name = "rbdvol")]
#[command(version, about = "Docker volume plugin for Ceph RBD block devices", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the volume plugin daemon.
    ///
    /// Binds the Docker plugin socket and serves the VolumeDriver protocol
    /// until a termination signal arrives:
    ///
    /// ```sh
    /// rbdvol serve --pool rbd --user admin --can-create \
    ///     --mount-root /var/lib/docker/volumes/rbd
    /// ```
    #[clap(verbatim_doc_comment)]
    Serve(Box<serve::ServeArgs>),
}
