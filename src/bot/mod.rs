pub mod commands;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::music::message::{DiscordMessenger, MessageDispatcher};
use crate::music::search::{SearchResolver, SpotifyClient, YoutubeClient};
use crate::music::MusicOrchestrator;
use poise::serenity_prelude::{self as serenity, GatewayIntents};
use songbird::SerenityInit;
use std::sync::{Arc, OnceLock};
use tracing::{error, info};

/// Shared data accessible in all commands
pub struct Data {
    pub orchestrator: Arc<MusicOrchestrator>,
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data").finish_non_exhaustive()
    }
}

/// Handle for the shutdown path; set once the framework finishes setup
static ORCHESTRATOR: OnceLock<Arc<MusicOrchestrator>> = OnceLock::new();

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Create and start the Discord client; resolves when the gateway
/// connection ends.
pub async fn start_bot(config: &'static AppConfig, pool: DbPool) -> Result<(), Error> {
    if config.discord.token.is_empty() {
        return Err("Discord token is empty".into());
    }

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: commands::all_commands(),
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!("Command error: {}", error);
                            let _ = ctx.say(format!("An error occurred: {}", error)).await;
                        }
                        poise::FrameworkError::Setup { error, .. } => {
                            error!("Setup error: {}", error);
                        }
                        err => {
                            error!("Framework error: {:?}", err);
                        }
                    }
                })
            },
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: Some(config.discord.prefix.clone()),
                ..Default::default()
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                info!(
                    "Registered {} slash commands globally",
                    framework.options().commands.len()
                );
                info!("Bot is ready! Logged in as {}", ready.user.name);

                let manager = songbird::get(ctx)
                    .await
                    .ok_or("Voice client not initialized")?;
                let dispatcher = Arc::new(MessageDispatcher::new(
                    Arc::new(DiscordMessenger::new(ctx.http.clone())),
                    config.messages.sticky_recent_window,
                ));
                let resolver = SearchResolver::new(
                    config.spotify.as_ref().map(SpotifyClient::new),
                    config.youtube.as_ref().map(YoutubeClient::new),
                );
                let orchestrator = Arc::new(MusicOrchestrator::new(
                    config,
                    pool,
                    manager,
                    Some(ctx.cache.clone()),
                    dispatcher,
                    resolver,
                ));
                if let Some(cache) = orchestrator.cache() {
                    cache.verify().await?;
                }
                orchestrator.start();
                let _ = ORCHESTRATOR.set(orchestrator.clone());

                Ok(Data { orchestrator })
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(&config.discord.token, intents)
        .framework(framework)
        .register_songbird()
        .await?;

    // Clean shutdown on SIGINT: loops drain, voice closes, gateway stops
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            if let Some(orchestrator) = ORCHESTRATOR.get() {
                orchestrator.shutdown().await;
            }
            shard_manager.shutdown_all().await;
        }
    });

    info!("Starting Discord client...");
    client.start().await?;
    Ok(())
}
