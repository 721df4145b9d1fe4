//! Producer command-line tool.
//!
//! Plans and publishes episodes, moves the current topic node, ends episodes
//! and dumps the transcript.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use clap::{Parser, Subcommand, ValueEnum};
use podcaster_core::{
    producer::{EpisodePlanner, LLMEpisodePlanner, MockEpisodePlanner, ProducerCoordinator},
    store::{self, CONVERSATION_STREAM},
    topic::TopicGraph,
    transcript::TranscriptEntry,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "producer", version, about = "Publish and steer podcast episodes", long_about = None)]
struct Cli {
    /// Coordination store: `redis://...` or `memory://`
    #[arg(long, env = "STORE_URL", default_value = "redis://127.0.0.1:6379")]
    store_url: String,

    /// Stream the transcript is appended to
    #[arg(long, env = "TRANSCRIPT_STREAM", default_value = CONVERSATION_STREAM)]
    transcript_stream: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan an episode about a topic and publish it
    Plan {
        #[arg(long)]
        topic: String,

        /// Backend used to plan the episode
        #[arg(long, env = "GENERATOR_PROVIDER", value_enum, default_value_t = PlannerProvider::Openai)]
        provider: PlannerProvider,

        #[arg(long, env = "CHAT_MODEL", default_value = "gpt-4o")]
        model: String,

        /// Print the planned graph instead of publishing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Publish a topic graph read from a JSON file
    Publish {
        #[arg(long)]
        graph: PathBuf,
    },
    /// Move the episode to another topic node
    Advance {
        /// Target node id; defaults to the next node in the script
        #[arg(long)]
        node: Option<String>,
    },
    /// End the running episode
    End {
        #[arg(long, default_value = "producer ended the episode")]
        reason: String,
    },
    /// Print the transcript
    Transcript,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PlannerProvider {
    Openai,
    Gemini,
    Mock,
}

fn build_planner(provider: PlannerProvider, model: &str) -> anyhow::Result<Box<dyn EpisodePlanner>> {
    let planner: Box<dyn EpisodePlanner> = match provider {
        PlannerProvider::Openai => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY must be set for 'openai' provider")?;
            let config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/");
            Box::new(LLMEpisodePlanner::new(config, model.to_string()))
        }
        PlannerProvider::Gemini => {
            let api_key = std::env::var("GEMINI_API_KEY")
                .context("GEMINI_API_KEY must be set for 'gemini' provider")?;
            let config = OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://generativelanguage.googleapis.com/v1beta/openai");
            Box::new(LLMEpisodePlanner::new(config, model.to_string()))
        }
        PlannerProvider::Mock => Box::new(MockEpisodePlanner),
    };
    Ok(planner)
}

fn print_entry(id: &str, entry: &TranscriptEntry) {
    match entry {
        TranscriptEntry::Utterance {
            agent_id,
            text,
            timestamp,
            node_id,
        } => println!("{id} {} [{node_id}] {agent_id}: {text}", timestamp.to_rfc3339()),
        TranscriptEntry::SystemSignal {
            event,
            agent_id,
            timestamp,
            metadata,
        } => println!(
            "{id} {} <{event}> {agent_id} {}",
            timestamp.to_rfc3339(),
            serde_json::to_string(metadata).unwrap_or_default()
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Logs go to stderr so the transcript dump stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    // The plan dry run never touches the store.
    if let Command::Plan {
        topic,
        provider,
        model,
        dry_run: true,
    } = &cli.command
    {
        let graph = build_planner(*provider, model)?.plan(topic).await?;
        println!("{}", serde_json::to_string_pretty(&graph)?);
        return Ok(());
    }

    let store = store::connect(&cli.store_url)
        .await
        .with_context(|| format!("Failed to connect to coordination store at {}", cli.store_url))?;
    let producer = ProducerCoordinator::new(store, cli.transcript_stream.clone());

    match cli.command {
        Command::Plan {
            topic,
            provider,
            model,
            ..
        } => {
            let planner = build_planner(provider, &model)?;
            let graph = producer.plan_and_publish(planner.as_ref(), &topic).await?;
            info!(%topic, nodes = graph.nodes.len(), "Episode planned and published");
        }
        Command::Publish { graph } => {
            let raw = std::fs::read_to_string(&graph)
                .with_context(|| format!("Failed to read {}", graph.display()))?;
            let parsed: TopicGraph = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a topic graph", graph.display()))?;
            producer.publish_episode(parsed).await?;
        }
        Command::Advance { node } => {
            let current = producer.advance(node.as_deref()).await?;
            println!("{current}");
        }
        Command::End { reason } => {
            producer.end_episode(&reason).await?;
        }
        Command::Transcript => {
            for (id, entry) in producer.transcript().await? {
                print_entry(&id.to_string(), &entry);
            }
        }
    }
    Ok(())
}
