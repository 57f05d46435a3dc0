//! Background probe loop for module file changes.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::module;
use crate::FilterHost;

/// Probe every dylib-backed slot each period; reload on content change.
/// A failed reload is logged and the previous module stays active.
pub(crate) async fn run(host: Arc<FilterHost>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(host.settings().watch_period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tick.tick() => {}
        }

        for (path, known) in host.watched() {
            match module::probe(&path, &known) {
                Ok(None) => {}
                Ok(Some(_)) => match host.load(&path) {
                    Ok(()) => info!(path = %path.display(), "filter module reloaded"),
                    Err(err) => warn!(
                        path = %path.display(),
                        %err,
                        "filter reload failed, keeping previous module"
                    ),
                },
                Err(err) => {
                    // Transient: the operator may be mid-write.
                    debug!(path = %path.display(), %err, "filter module probe failed");
                }
            }
        }
    }
}
