use crate::config::Config;
use crate::pipeline::IngestHandle;
use crate::telemetry::parse_payload;
use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS, SubscribeFilter};
use tokio::time::{sleep, Duration};

pub(crate) fn subscription_filters(config: &Config) -> Vec<SubscribeFilter> {
    config
        .sources
        .iter()
        .map(|source| SubscribeFilter::new(source.source.clone(), QoS::AtLeastOnce))
        .collect()
}

/// Subscribes to every configured source topic and feeds decoded readings
/// into the ingest pipeline. Reconnects forever; only returns when the
/// pipeline is gone.
pub async fn run_listener(config: Config, ingest: IngestHandle) -> Result<()> {
    let filters = subscription_filters(&config);
    let stats = ingest.stats();
    loop {
        let mut mqttoptions = MqttOptions::new(
            config.mqtt_client_id.clone(),
            config.mqtt_host.clone(),
            config.mqtt_port,
        );
        mqttoptions.set_keep_alive(config.mqtt_keepalive());
        if let Some(username) = &config.mqtt_username {
            mqttoptions.set_credentials(
                username.clone(),
                config.mqtt_password.clone().unwrap_or_default(),
            );
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 32);
        if let Err(err) = client.subscribe_many(filters.clone()).await {
            tracing::warn!(error=%err, "failed to subscribe to MQTT; retrying");
            sleep(Duration::from_secs(2)).await;
            continue;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    stats.set_mqtt_connected(true);
                    tracing::info!(
                        host = %config.mqtt_host,
                        port = config.mqtt_port,
                        topics = filters.len(),
                        "connected to MQTT broker"
                    );
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let received_at = Utc::now();
                    let mut payload = publish.payload.to_vec();
                    match parse_payload(&publish.topic, &mut payload, received_at) {
                        Ok(reading) => {
                            if let Err(err) = ingest.submit(reading).await {
                                stats.set_mqtt_connected(false);
                                tracing::warn!(error=%err, "ingest pipeline closed; stopping MQTT listener");
                                return Ok(());
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error=%err, topic=%publish.topic, "failed to decode MQTT payload")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    stats.set_mqtt_connected(false);
                    tracing::warn!(error=%err, "MQTT connection dropped; reconnecting");
                    break;
                }
            }
        }

        sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, SourceConfig};

    #[test]
    fn subscribes_to_each_source_topic_at_least_once() {
        let config = test_config(vec![
            SourceConfig::new("home/living", "Living"),
            SourceConfig::new("home/garden", "Garden"),
        ]);
        let filters = subscription_filters(&config);
        let paths: Vec<_> = filters.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["home/living", "home/garden"]);
        assert!(filters.iter().all(|f| f.qos == QoS::AtLeastOnce));
    }
}
