/// Rendering and delivery of monitor output.
///
/// [`EventSink`] turns a [`ChangeEvent`] into one line of text and hands it to
/// the transport for a single subscription. Delivery is at most once: a failed
/// send is reported to the caller and never retried.
use std::sync::Arc;
use std::time::Duration;

use crate::client::Snapshot;
use crate::error::DeliveryError;
use crate::event::ChangeEvent;
use crate::monitor::Subscription;
use crate::transport::{OutgoingMessage, Transport};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Proof that a notification reached the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivered;

#[derive(Clone)]
pub struct EventSink {
    transport: Arc<dyn Transport>,
    delivery_timeout: Duration,
}

impl EventSink {
    pub fn new(transport: Arc<dyn Transport>, delivery_timeout: Duration) -> Self {
        Self {
            transport,
            delivery_timeout,
        }
    }

    pub async fn publish(
        &self,
        event: &ChangeEvent,
        subscription: &Subscription,
    ) -> Result<Delivered, DeliveryError> {
        if subscription.is_cancelled() {
            return Err(DeliveryError::Cancelled);
        }
        let message = OutgoingMessage::plain(render_event(event));
        match tokio::time::timeout(
            self.delivery_timeout,
            self.transport.send(subscription.chat(), &message),
        )
        .await
        {
            Ok(Ok(())) => Ok(Delivered),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DeliveryError::TimedOut(self.delivery_timeout)),
        }
    }
}

pub fn render_event(event: &ChangeEvent) -> String {
    match event {
        ChangeEvent::Connected(client) => format!("VPN client connected: {}", client.label()),
        ChangeEvent::Disconnected { client, .. } => {
            format!("VPN client disconnected: {}", client.label())
        }
    }
}

/// One-shot status dump: a header line plus one line per connected client.
pub fn render_stats(snapshot: &Snapshot) -> String {
    let updated = match snapshot.updated_at() {
        Some(at) => at.format(TIME_FORMAT).to_string(),
        None => format!("{} UTC", snapshot.captured_at().format(TIME_FORMAT)),
    };
    let mut out = format!("Status updated at {updated}\n");

    if snapshot.is_empty() {
        out.push_str("No VPN clients are connected.\n");
        return out;
    }
    for (i, client) in snapshot.iter().enumerate() {
        out.push_str(&format!(
            "{} - {} is connected since {} from {}\n",
            i + 1,
            client.display_name,
            client.connected_since.format(TIME_FORMAT),
            client.identity,
        ));
    }
    out
}
