use crate::config::Config;
use crate::error::PipelineError;
use crate::ingest::Ingestor;
use crate::metrics::PipelineMetrics;
use anyhow::Result;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub fn topic_filters(prefix: &str) -> [String; 3] {
    [
        format!("{prefix}/sensors/data"),
        format!("{prefix}/sensors/status"),
        format!("{prefix}/+/heartbeat"),
    ]
}

fn mqtt_options(config: &Config) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    options.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        options.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    options
}

/// Subscribes to the sensor topics and hands every publish to the ingestor
/// until `cancel` fires. Broker drops are retried forever.
pub async fn run_listener(
    config: Config,
    ingestor: Ingestor,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let filters = topic_filters(ingestor.topic_prefix());
    'connect: while !cancel.is_cancelled() {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), 32);

        for filter in &filters {
            if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                tracing::warn!(
                    error = %err,
                    topic = %filter,
                    "failed to subscribe to MQTT; retrying"
                );
                metrics.source_connected.store(false, Ordering::Relaxed);
                tokio::select! {
                    _ = cancel.cancelled() => break 'connect,
                    _ = sleep(RESUBSCRIBE_DELAY) => continue 'connect,
                }
            }
        }
        tracing::info!(topics = ?filters, host = %config.mqtt_host, "subscribed to sensor feed");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(err) = client.disconnect().await {
                        tracing::debug!(error = %err, "MQTT disconnect failed");
                    }
                    break 'connect;
                }
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    metrics.source_connected.store(true, Ordering::Relaxed);
                    tracing::info!("connected to MQTT broker");
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let mut payload = publish.payload.to_vec();
                    match ingestor.handle_message(&publish.topic, &mut payload) {
                        Ok(_) => {}
                        // already counted and logged by the ingestor
                        Err(PipelineError::MalformedReading(_)) => {}
                        Err(err) => {
                            tracing::warn!(
                                error = %err,
                                topic = %publish.topic,
                                "failed to ingest MQTT message"
                            )
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    metrics.source_connected.store(false, Ordering::Relaxed);
                    tracing::warn!(error = %err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }

    metrics.source_connected.store(false, Ordering::Relaxed);
    tracing::info!("MQTT listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{classify_topic, TopicKind};

    #[test]
    fn filters_cover_every_routed_topic() {
        let [data, status, heartbeat] = topic_filters("hermes");
        assert_eq!(data, "hermes/sensors/data");
        assert_eq!(status, "hermes/sensors/status");
        assert_eq!(heartbeat, "hermes/+/heartbeat");
        assert_eq!(classify_topic("hermes", &data), TopicKind::SensorData);
        assert_eq!(classify_topic("hermes", &status), TopicKind::Status);
        assert_eq!(
            classify_topic("hermes", &heartbeat.replace('+', "node-1")),
            TopicKind::Heartbeat
        );
    }
}
