use anyhow::{Context, Result};
use serenity::{http::Http, model::gateway::GatewayIntents, Client};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use tune_playback::bot::{SerenityGateway, TuneBot};
use tune_playback::config::Config;
use tune_playback::node::{AudioNode, NodeClient, NodeId, NodePool, NodeSettings};
use tune_playback::orchestrator::Orchestrator;
use tune_playback::storage::JsonStore;
use tune_playback::voice::SessionSettings;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tune_playback=debug".parse()?)
                .add_directive("serenity=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Tune Playback v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Inicializar almacenamiento JSON
    let store = Arc::new(JsonStore::new(config.data_dir.clone()).await?);

    let http = Arc::new(Http::new(&config.discord_token));
    let user_id = http
        .get_current_user()
        .await
        .context("No se pudo obtener el usuario del bot")?
        .id;

    // Nodos de audio
    info!("🎼 Conectando {} nodos de audio...", config.nodes.len());
    let (signals_tx, signals_rx) = mpsc::unbounded_channel();
    let settings = NodeSettings::from_config(&config, user_id);
    let mut pool = NodePool::default();
    let mut clients = Vec::with_capacity(config.nodes.len());
    for (id, options) in config.nodes.iter().enumerate() {
        let client = Arc::new(NodeClient::new(
            NodeId(id as u32),
            options.clone(),
            settings.clone(),
            signals_tx.clone(),
        ));
        client.connect();
        pool.register(client.clone() as Arc<dyn AudioNode>);
        clients.push(client);
    }
    drop(signals_tx);

    let gateway = Arc::new(SerenityGateway::new(http));
    let orchestrator = Arc::new(Orchestrator::new(
        pool,
        store,
        gateway.clone(),
        SessionSettings::from_config(&config),
        config.default_volume,
    ));
    orchestrator.spawn_signal_loop(signals_rx);

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(TuneBot::new(orchestrator, gateway))
        .await?;

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        for node in &clients {
            node.shutdown();
        }
        shard_manager.shutdown_all().await;
    });

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start_autosharded().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}
