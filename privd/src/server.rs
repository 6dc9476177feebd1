//! The authenticated local channel.

use crate::{
    auth::{self, Secret},
    error::{Error, Fault},
    imsg::{Handler, Message},
    operations::{Registry, Request},
    value::Value,
};
use privd_log::{debug, info, warn};
use std::{io, path::Path, sync::Arc, time::Duration};
use tokio::{
    net::{UnixListener, UnixStream},
    time::{sleep, timeout},
};

/// Time a peer has to complete the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts connections and serves requests.
pub struct Server {
    listener: UnixListener,
    secret: Arc<Secret>,
    registry: Arc<Registry>,
}

impl Server {
    /// Listen on the channel path.
    pub fn bind<P: AsRef<Path>>(
        path: P,
        secret: Arc<Secret>,
        registry: Arc<Registry>,
    ) -> Result<Self, Error> {
        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            secret,
            registry,
        })
    }

    /// Serve connections forever.
    ///
    /// Every connection is handled by its own task.  Failing to accept
    /// a connection only affects that peer.
    pub async fn serve(self) -> Result<(), Error> {
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(err) => {
                    warn!("Failed to accept connection: {}", err);
                    if let Some(libc::EMFILE) | Some(libc::ENFILE) = err.raw_os_error() {
                        sleep(ACCEPT_BACKOFF).await;
                    }
                    continue;
                }
            };
            let secret = self.secret.clone();
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(err) = connection(stream, &secret, &registry).await {
                    warn!("Connection closed: {}", err);
                }
            });
        }
    }
}

async fn connection(stream: UnixStream, secret: &Secret, registry: &Registry) -> Result<(), Error> {
    let mut handler = Handler::from(stream);

    timeout(HANDSHAKE_TIMEOUT, auth::accept(&mut handler, secret)).await??;
    debug!("Client authenticated");

    loop {
        let reply = match handler.recv_message::<Request>().await {
            Ok(Some((message, request))) if message.id == Message::REQUEST => {
                registry.call(request).await
            }
            Ok(Some((message, _))) => {
                return Err(Error::InvalidArgument(
                    format!("unexpected message {}", message.id).into(),
                ))
            }
            Ok(None) => break,
            // The frame is consumed, tell the peer before closing.
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                let fault: Result<Value, Fault> = Err(Fault::Protocol(err.to_string()));
                let _ = handler
                    .send_message(Message::new(Message::REPLY), &fault)
                    .await;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        handler
            .send_message(Message::new(Message::REPLY), &reply)
            .await?;
    }

    info!("Client disconnected");
    Ok(())
}
