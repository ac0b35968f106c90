//! Single bounded poll against one site's queue.
//!
//! A poll waits for at most one delivery. Whatever happens inside the
//! deadline (a message, an empty queue, a broken transport) is folded into a
//! [`PollOutcome`] so one site can never stall or fail the whole run.

use crate::config::SiteConfig;
use crate::domain::PollOutcome;
use crate::metrics::metrics;
use crate::site_event;
use crate::transport::{SiteConsumer, SiteDelivery};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

const TARGET: &str = "condor_monitor::poller";

#[derive(Debug, Deserialize)]
struct MetricsMessage {
    condor_metrics: String,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("message body is not a JSON object with a `condor_metrics` string: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("`condor_metrics` is empty")]
    Empty,
}

/// Extracts the pre-serialized fragment from a producer message body.
pub fn decode_metrics_body(body: &[u8]) -> Result<String, PayloadError> {
    let message: MetricsMessage = serde_json::from_slice(body)?;
    let fragment = message.condor_metrics.trim();
    if fragment.is_empty() {
        return Err(PayloadError::Empty);
    }
    Ok(fragment.to_string())
}

pub struct SitePoller {
    deadline: Duration,
}

impl SitePoller {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn poll_once<C>(&self, site: &SiteConfig, consumer: &mut C) -> PollOutcome
    where
        C: SiteConsumer + ?Sized,
    {
        let counters = metrics();

        match timeout(self.deadline, consumer.next_delivery()).await {
            Err(_) => {
                counters.record_empty_poll();
                site_event!(
                    debug,
                    TARGET,
                    "poll_deadline_elapsed",
                    site = site.name,
                    vhost = site.virtual_host,
                    deadline_ms = self.deadline.as_millis()
                );
                PollOutcome::no_data(&site.name)
            }
            Ok(Ok(Some(delivery))) => self.accept(site, consumer, delivery).await,
            Ok(Ok(None)) => {
                counters.record_transport_error();
                site_event!(
                    warn,
                    TARGET,
                    "consumer_stream_closed",
                    site = site.name,
                    vhost = site.virtual_host
                );
                PollOutcome::no_data(&site.name)
            }
            Ok(Err(err)) => {
                counters.record_transport_error();
                site_event!(
                    error,
                    TARGET,
                    "consumer_receive_failed",
                    site = site.name,
                    vhost = site.virtual_host,
                    error = err
                );
                PollOutcome::no_data(&site.name)
            }
        }
    }

    async fn accept<C>(
        &self,
        site: &SiteConfig,
        consumer: &mut C,
        delivery: SiteDelivery,
    ) -> PollOutcome
    where
        C: SiteConsumer + ?Sized,
    {
        let delivery_tag = delivery.delivery_tag;
        let decoded = decode_metrics_body(&delivery.body);

        // A body we cannot read is still consumed so it does not block the queue.
        if let Err(err) = consumer.ack(delivery_tag).await {
            site_event!(
                error,
                TARGET,
                "ack_failed",
                site = site.name,
                vhost = site.virtual_host,
                delivery_tag = delivery_tag,
                error = err
            );
        }

        match decoded {
            Ok(raw) => {
                metrics().record_payload();
                site_event!(
                    info,
                    TARGET,
                    "payload_received",
                    site = site.name,
                    vhost = site.virtual_host,
                    delivery_tag = delivery_tag,
                    redelivered = delivery.redelivered
                );
                PollOutcome::payload(&site.name, raw)
            }
            Err(err) => {
                metrics().record_transport_error();
                site_event!(
                    warn,
                    TARGET,
                    "payload_rejected",
                    site = site.name,
                    vhost = site.virtual_host,
                    delivery_tag = delivery_tag,
                    error = err
                );
                PollOutcome::no_data(&site.name)
            }
        }
    }
}
