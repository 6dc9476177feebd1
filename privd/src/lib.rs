//! Privileged helper daemon.
//!
//! `privd` is started as root by an unprivileged management daemon,
//! the launcher, and performs a fixed set of privileged operations
//! on its behalf.  Requests arrive over a local channel that is
//! authenticated with a secret shared between the two processes.
//!
//! Most operations run directly in the daemon.  Identity-scoped
//! operations, like checking whether another user may access a
//! file, run in a short-lived worker process that is forked per call
//! and drops to the requested user and groups before doing any work.
//! The daemon never changes its own identity.
//!
//! The daemon lives as long as its launcher: when the launcher
//! process disappears, the channel is removed and the daemon exits.
//!
//! # Examples
//!
//! ```no_run
//! use privd::{Client, Secret};
//!
//! # async fn example() -> Result<(), privd::Error> {
//! let secret = Secret::new("abc123")?;
//! let mut client = Client::connect("/var/run/privd/privd.sock", &secret).await?;
//!
//! let serial = client.scsi_serial("/dev/sdb").await?;
//! client.validate_access("qemu", &["qemu"], "/rhev/data-center/image", "rw").await?;
//! # Ok(())
//! # }
//! ```

mod audit;
pub mod auth;
pub mod client;
pub mod config;
mod error;
pub mod executor;
pub mod imsg;
pub mod operations;
pub mod server;
pub mod supervisor;
pub mod value;

pub use {
    auth::Secret,
    client::Client,
    config::Config,
    error::{Error, Fault},
    executor::{Executor, Identity},
    operations::{Backend, Registry, Request, System},
    server::Server,
    value::{Options, Value},
};
