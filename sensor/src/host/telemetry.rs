use std::{future::Future, time::Duration};

use rumqttc::{AsyncClient, ConnectionError, Event, Incoming, MqttOptions, Outgoing, QoS};

use hopper_common::{Telemetry, TelemetryError, MQTT_CLIENT_ID, MQTT_KEEP_ALIVE_SECS};

const SESSION_TIMEOUT: Duration = Duration::from_secs(10);

pub trait TelemetryPublisher: Send + Sync + 'static {
    fn publish(
        &self,
        telemetry: &Telemetry,
    ) -> impl Future<Output = Result<(), TelemetryError>> + Send;
}

/// Opens a fresh broker session per reading: connect, three QoS 0
/// publishes, disconnect. No session outlives a reporting cycle.
pub struct MqttPublisher {
    timeout: Duration,
}

impl Default for MqttPublisher {
    fn default() -> Self {
        Self {
            timeout: SESSION_TIMEOUT,
        }
    }
}

impl TelemetryPublisher for MqttPublisher {
    async fn publish(&self, telemetry: &Telemetry) -> Result<(), TelemetryError> {
        let broker = &telemetry.broker;
        let mut options = MqttOptions::new(MQTT_CLIENT_ID, broker.host.clone(), broker.port);
        options.set_keep_alive(Duration::from_secs(MQTT_KEEP_ALIVE_SECS));
        if !broker.user.is_empty() {
            options.set_credentials(broker.user.clone(), broker.password.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 8);

        let session = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
                    Ok(_) => {}
                    Err(err) => return Err(classify(err)),
                }
            }

            for (topic, payload) in telemetry.messages() {
                client
                    .publish(topic, QoS::AtMostOnce, false, payload)
                    .await
                    .map_err(|err| TelemetryError::Connection(err.to_string()))?;
            }
            client
                .disconnect()
                .await
                .map_err(|err| TelemetryError::Connection(err.to_string()))?;

            // Requests leave in order, so seeing our disconnect means the
            // publishes before it were written.
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                    Ok(_) => {}
                    Err(err) => return Err(classify(err)),
                }
            }
        };

        tokio::time::timeout(self.timeout, session)
            .await
            .map_err(|_| TelemetryError::Timeout(self.timeout.as_millis() as u64))?
    }
}

fn classify(err: ConnectionError) -> TelemetryError {
    match err {
        ConnectionError::ConnectionRefused(code) => TelemetryError::refused(code as u8),
        other => TelemetryError::Connection(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use hopper_common::BrokerSettings;
    use rumqttc::ConnectReturnCode;

    use super::*;

    #[test]
    fn refused_credentials_are_auth_errors() {
        let err = classify(ConnectionError::ConnectionRefused(
            ConnectReturnCode::BadUserNamePassword,
        ));
        assert!(matches!(err, TelemetryError::Auth(_)));

        let err = classify(ConnectionError::ConnectionRefused(
            ConnectReturnCode::ServiceUnavailable,
        ));
        assert!(matches!(err, TelemetryError::Connection(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_is_reported_not_raised() {
        let publisher = MqttPublisher {
            timeout: Duration::from_secs(2),
        };
        let telemetry = Telemetry {
            level: 40,
            pellet_type: "oak".to_string(),
            battery: 80.0,
            broker: BrokerSettings {
                enabled: true,
                host: "127.0.0.1".to_string(),
                // Port 1 is never an MQTT listener on a test machine.
                port: 1,
                ..BrokerSettings::default()
            },
        };

        let result = publisher.publish(&telemetry).await;

        assert!(matches!(
            result,
            Err(TelemetryError::Connection(_) | TelemetryError::Timeout(_))
        ));
    }
}
