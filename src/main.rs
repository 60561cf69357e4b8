use anyhow::Context as _;
use clap::Parser as _;
use log::{LevelFilter, info};

mod command;
mod config;
mod desktop;
mod manager;
mod messages;
mod mqtt;
mod pipewire;
mod presence;
mod shutdown;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(LevelFilter::Info)
        .parse_env("RUST_LOG")
        .init();

    let cli = config::Cli::parse();
    let config = config::AppConfig::load(cli)?;

    info!(
        "Configuration loaded: broker {}:{} as {}, topic {}, PipeWire node {:?}",
        config.mqtt.host,
        config.mqtt.port,
        config.mqtt.username,
        config.mqtt.topic,
        config.node_name
    );

    let mut publisher = presence::PresencePublisher::new(
        mqtt::MqttClient::new(&config.mqtt),
        config.mqtt.topic.clone(),
    );
    info!("Connecting to MQTT broker {}:{}", config.mqtt.host, config.mqtt.port);
    publisher.connect().await.with_context(|| {
        format!(
            "failed to connect to MQTT broker {}:{}",
            config.mqtt.host, config.mqtt.port
        )
    })?;
    info!("Connected to MQTT broker");

    let shutdown = shutdown::listen(config.force_exit_after);

    let core = manager::Manager::new(
        config.node_name.clone(),
        pipewire::PipeWire::new(command::SystemRunner, &config.pipewire),
        publisher,
        desktop::GnomeDnd::new(command::SystemRunner, &config.desktop),
        config.poll_interval,
        config.disconnect_grace,
    );
    core.run_loop(shutdown).await;

    Ok(())
}
