//! Main Entrypoint for a Podcast Host
//!
//! This binary is responsible for:
//! 1. Loading configuration and the host persona.
//! 2. Connecting to the coordination store.
//! 3. Selecting the dialogue generator backend.
//! 4. Running the host session until Ctrl+C or a store failure.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use podcaster_core::{
    generator::{DialogueGenerator, EchoDialogueGenerator, OpenAICompatibleGenerator},
    media::ChannelTransport,
    persona::HostPersona,
    store,
    turn::HostAgent,
};
use podcaster_host::{
    config::{Config, Provider},
    session::HostSession,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, info, warn};

/// Resolves once `Ctrl+C` is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C, running until the session stops");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn build_generator(config: &Config) -> anyhow::Result<Arc<dyn DialogueGenerator>> {
    let generator: Arc<dyn DialogueGenerator> = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY is not set")?;
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/");
            Arc::new(OpenAICompatibleGenerator::new(
                openai_config,
                config.chat_model.clone(),
            ))
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_ref()
                .context("GEMINI_API_KEY is not set")?;
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://generativelanguage.googleapis.com/v1beta/openai");
            Arc::new(OpenAICompatibleGenerator::new(
                openai_config,
                config.chat_model.clone(),
            ))
        }
        Provider::Mock => {
            info!("Using mock provider.");
            Arc::new(EchoDialogueGenerator)
        }
    };
    Ok(generator)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let persona = HostPersona::load(&config.persona_path)
        .with_context(|| format!("Failed to load persona from {}", config.persona_path.display()))?;
    let agent_id = config.agent_id_for(&persona);
    info!(%agent_id, persona = %persona.name, "Persona loaded");

    // --- 3. Connect Shared Services ---
    let store = store::connect(&config.store_url)
        .await
        .with_context(|| format!("Failed to connect to coordination store at {}", config.store_url))?;
    let generator = build_generator(&config)?;

    // A deployment plugs its room adapter in here: a `MediaTransport` over
    // LiveKit (or another WebRTC SFU) that announces one `InboundTrack` per
    // participant with VAD boundaries, and a TTS stage that owns
    // `outbound_tx` and feeds synthesized frames through the gate. Until
    // then the host runs against an in-process transport with no
    // participants, so only the turn loop is live.
    let transport = Arc::new(ChannelTransport::new());
    let (_outbound_tx, outbound_rx) = mpsc::channel(64);

    let agent = HostAgent::new(
        agent_id.clone(),
        persona,
        store.clone(),
        generator.clone(),
        config.turn_config(),
    );
    let session = HostSession::new(
        agent,
        generator,
        store,
        transport,
        config.transcript_stream.clone(),
    );

    // --- 4. Run ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        store_url = %config.store_url,
        "Host configured. Waiting for an episode..."
    );
    let report = session
        .run(outbound_rx, shutdown_signal())
        .instrument(tracing::info_span!("host", %agent_id))
        .await?;

    info!(
        audit_entries = report.audit_entries,
        dropped_frames = report.dropped_frames,
        "Host has shut down."
    );
    Ok(())
}
