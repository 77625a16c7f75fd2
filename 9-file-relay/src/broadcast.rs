use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::{message::ServerEvent, registry::Registry};

/// Every name in `usernames` except the recipient's own, in sorted order.
pub fn roster_for<'a, I>(usernames: I, recipient: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut roster: Vec<String> = usernames
        .into_iter()
        .filter(|username| username.as_str() != recipient)
        .cloned()
        .collect();
    roster.sort();
    roster
}

/// Pushes the current roster to every registered connection.
///
/// Recipients that cannot take the message within `deadline` are closed and
/// dropped from the registry. Returns how many recipients were reached.
pub async fn broadcast_roster(registry: &Registry, deadline: Duration) -> usize {
    let snapshot = registry.snapshot();
    let usernames: Vec<String> = snapshot.iter().map(|(name, _)| name.clone()).collect();

    let deliveries = snapshot.iter().map(|(recipient, handle)| {
        let event = ServerEvent::AllOnlineUsers {
            content: roster_for(&usernames, recipient),
        };
        async move { (recipient, handle, handle.send_json(&event, deadline).await) }
    });

    let mut delivered = 0;
    for (recipient, handle, result) in join_all(deliveries).await {
        match result {
            Ok(()) => delivered += 1,
            Err(error) => {
                warn!(username = %recipient, %error, "roster delivery failed, dropping connection");
                handle.close();
                registry.unregister_connection(recipient, handle.id());
            }
        }
    }

    debug!(online = usernames.len(), delivered, "roster broadcast");
    delivered
}
