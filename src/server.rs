//! TCP accept loop feeding agent connections into a [`Registry`].

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::registry::Registry;

/// Accept connections until `shutdown` fires, one task per connection.
///
/// On shutdown every session is ended and this returns once all of them have.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Accepting agent connections");
    }
    let sessions = TaskTracker::new();

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                }
                let registry = Arc::clone(&registry);
                sessions.spawn(async move {
                    let reason = registry.run(stream).await;
                    debug!(%peer, %reason, "Connection finished");
                });
            }
            Err(e) => warn!(error = %e, "Failed to accept connection"),
        }
    }

    registry.shutdown();
    sessions.close();
    sessions.wait().await;
    info!("Stopped accepting agent connections");
}
