use anyhow::Result;
use herald_config::KafkaConfig;
use rdkafka::config::ClientConfig;
use tracing::info;

/// Build the rdkafka client settings shared by producers and consumers
///
/// Handles bootstrap servers, TLS, the CA bundle and SASL credentials.
pub fn create_client_config(config: &KafkaConfig) -> Result<ClientConfig> {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.brokers);

    if !config.enabled {
        return Ok(client_config);
    }

    client_config.set("security.protocol", "plaintext");

    if config.ssl_enabled {
        info!("Enabling SSL/TLS for Kafka connection");
        client_config.set("security.protocol", "ssl");
        if let Some(ca_location) = &config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    match (
        &config.sasl_mechanism,
        &config.sasl_username,
        &config.sasl_password,
    ) {
        (Some(mechanism), Some(username), Some(password)) => {
            info!(sasl_mechanism = %mechanism, "Configuring SASL authentication");
            client_config
                .set("sasl.mechanism", mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password)
                .set(
                    "security.protocol",
                    if config.ssl_enabled {
                        "sasl_ssl"
                    } else {
                        "sasl_plaintext"
                    },
                );
        }
        (Some(_), _, _) => {
            anyhow::bail!("KAFKA_SASL_MECHANISM requires KAFKA_SASL_USERNAME and KAFKA_SASL_PASSWORD");
        }
        _ => {}
    }

    Ok(client_config)
}
