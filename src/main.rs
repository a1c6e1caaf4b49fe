use personacord::archive::{
    ArchiveSettings, ArchiveStore, HistoryArchive, InMemoryArchiveStore, NickMap,
    QdrantArchiveStore,
};
use personacord::assistant::{Assistant, AssistantSettings};
use personacord::commands::{chat, history, track};
use personacord::context::{ChannelContextEngine, ContextSettings};
use personacord::conversation::{ConversationLimits, ConversationManager};
use personacord::db::Database;
use personacord::facts::{FactBackend, FactExtractor};
use personacord::indexer::{BatchIndexer, IndexerSettings};
use personacord::llm::LlmClient;
use personacord::message::MessageRecord;
use personacord::persona::PersonaRegistry;
use personacord::rag::{InMemoryVectorStore, QdrantStore, VectorStore};
use personacord::services::SqliteFactStore;
use personacord::{config::Config, Data};
use poise::serenity_prelude as serenity;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,serenity=warn,poise=warn")),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config);
    let discord_token = config.discord_token.clone();

    let db = Database::new(&config)?;
    db.execute_init()?;

    let llm = Arc::new(LlmClient::new(&config));

    let store: Arc<dyn VectorStore> = match &config.qdrant_url {
        Some(url) => {
            info!("Semantic index: Qdrant at {} ({})", url, config.qdrant_collection);
            Arc::new(QdrantStore::new(
                url,
                config.qdrant_api_key.clone(),
                &config.qdrant_collection,
                config.embedding_dimensions,
                Duration::from_secs(config.embedding_timeout_secs),
            )?)
        }
        None => {
            warn!("QDRANT_URL not set; semantic index is kept in memory and lost on restart");
            Arc::new(InMemoryVectorStore::new())
        }
    };
    let indexer = Arc::new(BatchIndexer::new(
        llm.clone(),
        store,
        IndexerSettings::from_config(&config),
    ));

    let facts = if config.fact_extraction_enabled {
        let backend: Arc<dyn FactBackend> = Arc::new(SqliteFactStore::new(db.clone(), llm.clone()));
        FactExtractor::new(
            Some(backend),
            config.fact_extraction_threshold,
            config.fact_extraction_window,
        )
    } else {
        info!("Fact extraction disabled");
        FactExtractor::disabled()
    };

    let engine = Arc::new(ChannelContextEngine::new(
        db.clone(),
        indexer,
        Arc::new(facts),
        ContextSettings::from_config(&config),
    ));
    engine.start().await?;

    let archive_store: Arc<dyn ArchiveStore> = match &config.qdrant_url {
        Some(url) => {
            info!("IRC archive: Qdrant at {} ({})", url, config.history_collection);
            Arc::new(QdrantArchiveStore::new(
                url,
                config.qdrant_api_key.clone(),
                &config.history_collection,
                config.embedding_dimensions,
                Duration::from_secs(config.embedding_timeout_secs),
            )?)
        }
        None => Arc::new(InMemoryArchiveStore::new()),
    };
    let archive = Arc::new(HistoryArchive::new(
        llm.clone(),
        archive_store,
        NickMap::load(&config.history_nick_map_file)?,
        ArchiveSettings::from_config(&config),
    )?);

    let personas = PersonaRegistry::load(&config.personas_file)?;
    info!("Personas available: {}", personas.ids().join(", "));

    let assistant = Arc::new(Assistant::new(
        personas,
        ConversationManager::new(db.clone(), ConversationLimits::from_config(&config)),
        engine.clone(),
        llm,
        AssistantSettings::from_config(&config),
    ));

    let owners: HashSet<serenity::UserId> = config
        .owner_id
        .map(serenity::UserId::new)
        .into_iter()
        .collect();

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                chat::chat(),
                chat::resume(),
                chat::reset(),
                chat::expire(),
                chat::status(),
                chat::personas(),
                track::track(),
                history::history(),
            ],
            owners,
            event_handler: |_ctx, event, _framework, data| {
                Box::pin(async move {
                    if let serenity::FullEvent::Message { new_message } = event {
                        data.assistant
                            .engine()
                            .record_message(MessageRecord::from(new_message));
                    }
                    Ok(())
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    if let Err(e) = poise::builtins::on_error(error).await {
                        error!("Error while handling command error: {}", e);
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                info!("Bot is ready!");
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                // Set bot status
                ctx.set_activity(Some(serenity::ActivityData::custom(&config.status_message)));

                Ok(Data {
                    config,
                    assistant,
                    archive,
                })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged()
        | serenity::GatewayIntents::MESSAGE_CONTENT
        | serenity::GatewayIntents::GUILD_MESSAGES;

    let mut client = serenity::ClientBuilder::new(&discord_token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting bot...");
    if let Err(why) = client.start().await {
        error!("Client error: {:?}", why);
    }

    engine.stop().await;
    Ok(())
}
