//! The fixed table of privileged operations.
//!
//! Operations either run directly in the daemon, which is already
//! root, or are identity-scoped and run in a worker under a
//! caller-supplied user and group set.

mod access;
mod network;
mod storage;

pub use network::NetworkAction;

use crate::{
    audit,
    config::Config,
    error::{Error, Fault},
    executor::{Executor, Identity},
    value::{Options, Value},
};
use async_trait::async_trait;
use privd_derive::Operation;
use serde_derive::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use tokio::task;

/// A call of one of the exposed operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Operation)]
pub enum Request {
    /// Look up the vendor serial of a SCSI device.
    GetScsiSerial { device: String },
    /// Rescan the sessions of all iSCSI hosts.
    #[name = "forceIScsiScan"]
    ForceIScsiScan,
    /// Read a block from each device with direct I/O.
    TestReadDevices { devices: Vec<String> },
    /// Remove a device-mapper mapping.
    RemoveDeviceMapping { name: String },
    /// Status of all multipath paths.
    GetPathsStatus,
    AddNetwork {
        bridge: String,
        options: Options,
    },
    DelNetwork {
        bridge: String,
        options: Options,
    },
    EditNetwork {
        old_bridge: String,
        new_bridge: String,
        options: Options,
    },
    SetupNetworks {
        networks: Options,
        bondings: Options,
        options: Options,
    },
    /// Check that `user` with `groups` may access `path` in `mode`.
    #[run_as]
    ValidateAccess {
        user: String,
        groups: Vec<String>,
        path: String,
        mode: String,
    },
    SetSafeNetworkConfig,
}

/// The bodies of the privileged operations.
///
/// Implementations must be safe to call concurrently, the daemon does
/// not serialize calls.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn scsi_serial(&self, device: &str) -> Result<String, Fault>;

    async fn force_iscsi_scan(&self) -> Result<(), Fault>;

    async fn test_read_devices(&self, devices: &[String]) -> Result<(), Fault>;

    async fn remove_mapping(&self, name: &str) -> Result<(), Fault>;

    async fn paths_status(&self) -> Result<BTreeMap<String, String>, Fault>;

    async fn network(&self, action: NetworkAction, arguments: Value) -> Result<Value, Fault>;

    /// Runs inside the privilege-dropped worker.
    fn validate_access(&self, path: &str, mode: &str) -> Result<(), Fault>;
}

/// The default backend that operates on the local system.
#[derive(Debug)]
pub struct System {
    network_helper: PathBuf,
    device_read_size: usize,
}

impl System {
    pub fn new(config: &Config) -> Self {
        Self {
            network_helper: config.network_helper.clone(),
            device_read_size: config.device_read_size,
        }
    }
}

#[async_trait]
impl Backend for System {
    async fn scsi_serial(&self, device: &str) -> Result<String, Fault> {
        storage::scsi_serial(device).await
    }

    async fn force_iscsi_scan(&self) -> Result<(), Fault> {
        storage::force_iscsi_scan().await
    }

    async fn test_read_devices(&self, devices: &[String]) -> Result<(), Fault> {
        storage::test_read_devices(devices, self.device_read_size).await
    }

    async fn remove_mapping(&self, name: &str) -> Result<(), Fault> {
        storage::remove_mapping(name).await
    }

    async fn paths_status(&self) -> Result<BTreeMap<String, String>, Fault> {
        storage::paths_status().await
    }

    async fn network(&self, action: NetworkAction, arguments: Value) -> Result<Value, Fault> {
        network::run_helper(&self.network_helper, action, &arguments).await
    }

    fn validate_access(&self, path: &str, mode: &str) -> Result<(), Fault> {
        access::validate(path, mode)
    }
}

/// Dispatches requests to the backend, every call is logged on failure.
pub struct Registry {
    backend: Arc<dyn Backend>,
    executor: Arc<Executor>,
}

impl Registry {
    pub fn new(backend: Arc<dyn Backend>, executor: Arc<Executor>) -> Self {
        Self { backend, executor }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Call an operation.
    ///
    /// Identity-scoped operations always run in a worker.
    pub async fn call(&self, request: Request) -> Result<Value, Fault> {
        let name = request.name();
        let call = async move {
            if request.is_identity_scoped() {
                self.run_as(request).await
            } else {
                self.run(request).await
            }
        };
        audit::logged(name, call).await
    }

    /// Run a direct operation in the daemon.
    async fn run(&self, request: Request) -> Result<Value, Fault> {
        let backend = &self.backend;

        match request {
            Request::GetScsiSerial { device } => {
                backend.scsi_serial(&device).await.map(Into::into)
            }
            Request::ForceIScsiScan => backend.force_iscsi_scan().await.map(Into::into),
            Request::TestReadDevices { devices } => {
                backend.test_read_devices(&devices).await.map(Into::into)
            }
            Request::RemoveDeviceMapping { name } => {
                backend.remove_mapping(&name).await.map(Into::into)
            }
            Request::GetPathsStatus => backend.paths_status().await.map(Into::into),
            Request::AddNetwork { bridge, options } => {
                let arguments =
                    arguments(vec![("bridge", bridge.into()), ("options", options.into())]);
                backend.network(NetworkAction::Add, arguments).await
            }
            Request::DelNetwork { bridge, options } => {
                let arguments =
                    arguments(vec![("bridge", bridge.into()), ("options", options.into())]);
                backend.network(NetworkAction::Delete, arguments).await
            }
            Request::EditNetwork {
                old_bridge,
                new_bridge,
                options,
            } => {
                let arguments = arguments(vec![
                    ("old_bridge", old_bridge.into()),
                    ("new_bridge", new_bridge.into()),
                    ("options", options.into()),
                ]);
                backend.network(NetworkAction::Edit, arguments).await
            }
            Request::SetupNetworks {
                networks,
                bondings,
                options,
            } => {
                let arguments = arguments(vec![
                    ("networks", networks.into()),
                    ("bondings", bondings.into()),
                    ("options", options.into()),
                ]);
                backend.network(NetworkAction::Setup, arguments).await
            }
            Request::SetSafeNetworkConfig => {
                backend
                    .network(NetworkAction::SetSafeConfig, Value::Null)
                    .await
            }
            request @ Request::ValidateAccess { .. } => Err(misrouted(&request)),
        }
    }

    /// Run an identity-scoped operation in a worker.
    async fn run_as(&self, request: Request) -> Result<Value, Fault> {
        let backend = self.backend.clone();

        let (user, groups, operation) = match request {
            Request::ValidateAccess {
                user,
                groups,
                path,
                mode,
            } => {
                let operation: Operation =
                    Box::new(move || backend.validate_access(&path, &mode).map(Into::into));
                (user, groups, operation)
            }
            request => return Err(misrouted(&request)),
        };

        if user.is_empty() {
            return Err(Fault::InvalidArgument("missing user".to_string()));
        }

        let executor = self.executor.clone();
        task::spawn_blocking(move || {
            // Resolving might query remote directories and block.
            let identity = Identity::resolve(&user, &groups)?;
            executor.run_as(&identity, operation)
        })
        .await
        .map_err(Error::from)?
    }
}

/// Body of an identity-scoped operation.
type Operation = Box<dyn FnOnce() -> Result<Value, Fault> + Send>;

fn misrouted(request: &Request) -> Fault {
    Fault::Protocol(format!(
        "{} cannot run {}",
        request.name(),
        if request.is_identity_scoped() {
            "in the daemon"
        } else {
            "in a worker"
        }
    ))
}

fn arguments(values: Vec<(&str, Value)>) -> Value {
    Value::Map(
        values
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect(),
    )
}
