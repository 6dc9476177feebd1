//! Client of the local channel.

use crate::{
    auth::{self, Secret},
    error::{Error, Fault},
    imsg::{Handler, Message},
    operations::Request,
    value::{Options, Value},
};
use std::{collections::BTreeMap, io, path::Path};

/// An authenticated connection to the daemon.
#[derive(Debug)]
pub struct Client {
    handler: Handler,
}

impl Client {
    /// Connect and authenticate in both directions.
    pub async fn connect<P: AsRef<Path>>(path: P, secret: &Secret) -> Result<Self, Error> {
        let mut handler = Handler::connect(path).await?;
        auth::connect(&mut handler, secret).await?;
        Ok(Self { handler })
    }

    /// Call an operation.
    ///
    /// A fault produced by the daemon is returned as `Error::Remote`.
    pub async fn call(&mut self, request: &Request) -> Result<Value, Error> {
        self.handler
            .send_message(Message::new(Message::REQUEST), request)
            .await?;

        match self.handler.recv_message::<Result<Value, Fault>>().await? {
            Some((message, reply)) if message.id == Message::REPLY => reply.map_err(Error::Remote),
            Some((message, _)) => Err(Error::InvalidArgument(
                format!("unexpected message {}", message.id).into(),
            )),
            None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
        }
    }

    pub async fn scsi_serial(&mut self, device: &str) -> Result<String, Error> {
        let reply = self
            .call(&Request::GetScsiSerial {
                device: device.to_string(),
            })
            .await?;
        string(reply)
    }

    pub async fn force_iscsi_scan(&mut self) -> Result<(), Error> {
        self.call(&Request::ForceIScsiScan).await.map(drop)
    }

    pub async fn test_read_devices(&mut self, devices: &[&str]) -> Result<(), Error> {
        let devices = devices.iter().map(|device| device.to_string()).collect();
        self.call(&Request::TestReadDevices { devices })
            .await
            .map(drop)
    }

    pub async fn remove_device_mapping(&mut self, name: &str) -> Result<(), Error> {
        self.call(&Request::RemoveDeviceMapping {
            name: name.to_string(),
        })
        .await
        .map(drop)
    }

    /// Returns the state of every multipath path.
    pub async fn paths_status(&mut self) -> Result<BTreeMap<String, String>, Error> {
        match self.call(&Request::GetPathsStatus).await? {
            Value::Map(map) => map
                .into_iter()
                .map(|(path, state)| Ok((path, string(state)?)))
                .collect(),
            reply => Err(unexpected(&reply)),
        }
    }

    pub async fn add_network(&mut self, bridge: &str, options: Options) -> Result<Value, Error> {
        self.call(&Request::AddNetwork {
            bridge: bridge.to_string(),
            options,
        })
        .await
    }

    pub async fn del_network(&mut self, bridge: &str, options: Options) -> Result<Value, Error> {
        self.call(&Request::DelNetwork {
            bridge: bridge.to_string(),
            options,
        })
        .await
    }

    pub async fn edit_network(
        &mut self,
        old_bridge: &str,
        new_bridge: &str,
        options: Options,
    ) -> Result<Value, Error> {
        self.call(&Request::EditNetwork {
            old_bridge: old_bridge.to_string(),
            new_bridge: new_bridge.to_string(),
            options,
        })
        .await
    }

    pub async fn setup_networks(
        &mut self,
        networks: Options,
        bondings: Options,
        options: Options,
    ) -> Result<Value, Error> {
        self.call(&Request::SetupNetworks {
            networks,
            bondings,
            options,
        })
        .await
    }

    pub async fn set_safe_network_config(&mut self) -> Result<Value, Error> {
        self.call(&Request::SetSafeNetworkConfig).await
    }

    /// Check access of `path` as `user` with the supplementary `groups`.
    pub async fn validate_access(
        &mut self,
        user: &str,
        groups: &[&str],
        path: &str,
        mode: &str,
    ) -> Result<(), Error> {
        self.call(&Request::ValidateAccess {
            user: user.to_string(),
            groups: groups.iter().map(|group| group.to_string()).collect(),
            path: path.to_string(),
            mode: mode.to_string(),
        })
        .await
        .map(drop)
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<(), Error> {
        self.handler.shutdown().await.map_err(Into::into)
    }
}

fn string(value: Value) -> Result<String, Error> {
    match value {
        Value::Str(value) => Ok(value),
        value => Err(unexpected(&value)),
    }
}

fn unexpected(value: &Value) -> Error {
    Error::Remote(Fault::Protocol(format!("unexpected reply {:?}", value)))
}
