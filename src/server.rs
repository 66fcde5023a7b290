use std::future::Future;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cmd::Command;
use crate::config::Config;
use crate::connection::Connection;
use crate::db::{Db, DbHolder};
use crate::frame::Frame;
use crate::snapshot;

struct Listener {
    listener: TcpListener,
    db_holder: DbHolder,
    config: Arc<Config>,
    shutdown_token: CancellationToken,
}

struct Handler {
    connection: Connection,
    db: Db,
    config: Arc<Config>,
    shutdown: CancellationToken,
}

/// Run the server on the given listener until `shutdown` resolves.
///
/// The dataset is hydrated from the snapshot file before the first
/// connection is accepted. A missing snapshot starts an empty dataset;
/// a corrupt one is logged and likewise starts empty.
pub async fn run(listener: TcpListener, config: Config, shutdown: impl Future) {
    let config = Arc::new(config);
    let db_holder = DbHolder::new();

    match snapshot::load(&config) {
        Ok(Some(entries)) => {
            info!(
                keys = entries.len(),
                path = %config.db_path().display(),
                "loaded snapshot"
            );
            db_holder.db().hydrate(entries);
        }
        Ok(None) => {
            info!(path = %config.db_path().display(), "no snapshot found, starting empty");
        }
        Err(err) => {
            error!(
                cause = %err,
                path = %config.db_path().display(),
                "failed to load snapshot, starting empty"
            );
        }
    }

    let shutdown_token = CancellationToken::new();

    let mut server = Listener {
        listener,
        db_holder,
        config,
        shutdown_token: shutdown_token.clone(),
    };

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            info!("shutting down");
            shutdown_token.cancel();
        }
    }
}

impl Listener {
    async fn run(&mut self) -> crate::Result<()> {
        loop {
            let socket = self.accept().await;

            let mut handler = Handler {
                connection: Connection::new(socket),
                db: self.db_holder.db(),
                config: Arc::clone(&self.config),
                shutdown: self.shutdown_token.child_token(),
            };

            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    warn!(cause = %err, "connection error");
                }
            });
        }
    }

    /// Accept the next connection. Accept errors after a successful bind
    /// are transient (a connection storm can exhaust descriptors), so
    /// they are logged and retried with backoff rather than ending the
    /// listener.
    async fn accept(&mut self) -> TcpStream {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok((tcp_stream, addr)) => {
                    debug!(peer = %addr, "accepted connection");
                    return tcp_stream;
                }
                Err(err) => {
                    warn!(cause = %err, "accept error; retrying");
                    time::sleep(Duration::from_secs(backoff)).await;

                    if backoff < 64 {
                        backoff *= 2;
                    }
                }
            }
        }
    }
}

impl Handler {
    /// Per-connection loop: frame in, command out, until the peer hangs
    /// up or the server shuts down. Pipelined requests buffered by the
    /// connection are dispatched back to back.
    async fn run(&mut self) -> crate::Result<()> {
        loop {
            let maybe_frame = tokio::select! {
                res = self.connection.read_frame() => res,
                _ = self.shutdown.cancelled() => return Ok(()),
            };

            let frame = match maybe_frame {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(err) => {
                    // Malformed framing: the buffer cannot be trusted
                    // past this point, so reply and drop the connection.
                    let response = Frame::Error(format!("ERR protocol error: {}", err));
                    let _ = self.connection.write_frame(&response).await;

                    return Err(err);
                }
            };

            debug!(?frame, "request");

            // an empty request array gets no reply
            if matches!(frame, Frame::Array(ref parts) if parts.is_empty()) {
                continue;
            }

            match Command::from_frame(frame) {
                Ok(cmd) => cmd.apply(&mut self.connection, &self.db, &self.config).await?,
                Err(err) => {
                    let response = Frame::Error(err.to_string());
                    self.connection.write_frame(&response).await?;
                }
            }
        }
    }
}
