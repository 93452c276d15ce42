//! # rbdvol
//!
//! `rbdvol` is a Docker volume plugin daemon for Ceph RBD block devices.
//! It listens on a Unix socket for the Docker VolumeDriver protocol and
//! turns volume names like `pool/image@size` into mounted host paths:
//! provisioning the image if allowed, taking an advisory lock so at most
//! one host owns it, mapping it into the kernel, verifying and mounting
//! its filesystem, and unwinding all of that on Unmount.
//!
//! The lifecycle engine lives in [`volume::engine`]; the command-line
//! backend talking to `rbd` and the host utilities lives in [`rbd::cli`].
pub mod cmd;
pub mod config;
pub mod error;
pub mod logging;
pub mod name;
pub mod rbd;
pub mod shell;
pub mod volume;
