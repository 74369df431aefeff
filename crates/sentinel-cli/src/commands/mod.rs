//! Subcommand implementations.

pub mod dlq;
pub mod pipeline;
pub mod status;

use clap::Args;
use sentinel_core::Config;
use tokio::sync::broadcast;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Override Kafka bootstrap servers (comma separated)
    #[arg(long)]
    pub bootstrap_servers: Option<String>,

    /// Override the change event topic
    #[arg(long)]
    pub topic: Option<String>,

    /// Override the consumer group
    #[arg(long)]
    pub consumer_group: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(servers) = &self.bootstrap_servers {
            config.kafka.bootstrap_servers = servers.split(',').map(String::from).collect();
        }
        if let Some(topic) = &self.topic {
            config.kafka.topic = topic.clone();
        }
        if let Some(group) = &self.consumer_group {
            config.kafka.consumer_group = group.clone();
        }
    }
}

/// Send on `shutdown_tx` at SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                        }
                        _ = sigterm.recv() => {
                            info!("Received SIGTERM, initiating graceful shutdown");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        let _ = shutdown_tx.send(());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_kafka_settings() {
        let mut config = Config::default();
        let overrides = Overrides {
            bootstrap_servers: Some("a:9092,b:9092".into()),
            topic: Some("cdc.events".into()),
            consumer_group: None,
        };
        let group = config.kafka.consumer_group.clone();
        overrides.apply(&mut config);

        assert_eq!(config.kafka.bootstrap_servers, vec!["a:9092", "b:9092"]);
        assert_eq!(config.kafka.topic, "cdc.events");
        assert_eq!(config.kafka.consumer_group, group);
    }
}
