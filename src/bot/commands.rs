//! Music command surface.

use crate::bot::Data;
use crate::music::search::Requester;
use crate::music::PlaylistSelector;
use poise::serenity_prelude as serenity;

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

pub fn all_commands() -> Vec<poise::Command<Data, Error>> {
    vec![
        join(),
        play(),
        skip(),
        pause(),
        resume(),
        stop(),
        remove(),
        bump(),
        shuffle(),
        queue(),
        history(),
        move_messages(),
        random_play(),
        playlist(),
    ]
}

/// Voice channel the invoking user currently sits in
fn user_voice_channel(ctx: &Context<'_>) -> Result<serenity::ChannelId, Error> {
    let guild = ctx.guild().ok_or("Must be used in a server")?.clone();
    let voice_state = guild.voice_states.get(&ctx.author().id);
    match voice_state.and_then(|vs| vs.channel_id) {
        Some(id) => Ok(id),
        None => Err("You're not in a voice channel".into()),
    }
}

fn requester(ctx: &Context<'_>) -> Result<Requester, Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    Ok(Requester {
        guild_id: guild_id.get(),
        channel_id: ctx.channel_id().get(),
        name: ctx.author().display_name().to_string(),
        id: ctx.author().id.get(),
    })
}

/// Join your current voice channel
#[poise::command(slash_command, prefix_command, guild_only, aliases("awaken"))]
pub async fn join(ctx: Context<'_>) -> Result<(), Error> {
    let requester = requester(&ctx)?;
    let voice_channel = user_voice_channel(&ctx)?;
    ctx.defer().await?;
    ctx.data()
        .orchestrator
        .ensure_player(requester.guild_id, voice_channel.get(), requester.channel_id)
        .await?;
    ctx.say("Joined your voice channel").await?;
    Ok(())
}

/// Play a track, playlist, album, or search
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn play(
    ctx: Context<'_>,
    #[description = "URL or search text; append 'shuffle' or a number to modify playlists"]
    #[rest]
    search: String,
) -> Result<(), Error> {
    let requester = requester(&ctx)?;
    let voice_channel = user_voice_channel(&ctx)?;
    ctx.defer().await?;
    ctx.data()
        .orchestrator
        .play(requester, voice_channel.get(), &search)
        .await?;
    ctx.say("Processing your request").await?;
    Ok(())
}

/// Skip the current track
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn skip(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data().orchestrator.skip(guild_id.get()).await?;
    ctx.say("Skipped").await?;
    Ok(())
}

/// Pause playback
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn pause(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data().orchestrator.pause(guild_id.get()).await?;
    ctx.say("Paused").await?;
    Ok(())
}

/// Resume playback
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn resume(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data().orchestrator.resume(guild_id.get()).await?;
    ctx.say("Resumed").await?;
    Ok(())
}

/// Stop playback and leave the voice channel
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn stop(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data().orchestrator.stop(guild_id.get()).await?;
    ctx.say("Stopped").await?;
    Ok(())
}

/// Remove a queue entry by position
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn remove(
    ctx: Context<'_>,
    #[description = "Queue position, starting at 1"] index: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let title = ctx
        .data()
        .orchestrator
        .remove_queue_item(guild_id.get(), index)?;
    ctx.say(format!("Removed \"{title}\"")).await?;
    Ok(())
}

/// Move a queue entry to the front
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn bump(
    ctx: Context<'_>,
    #[description = "Queue position, starting at 1"] index: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data()
        .orchestrator
        .bump_queue_item(guild_id.get(), index)?;
    ctx.say("Bumped to the front").await?;
    Ok(())
}

/// Shuffle the play queue
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn shuffle(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data().orchestrator.shuffle_queue(guild_id.get())?;
    ctx.say("Shuffled").await?;
    Ok(())
}

/// Show the play queue
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn queue(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data().orchestrator.show_queue(guild_id.get())?;
    ctx.say("Queue posted").await?;
    Ok(())
}

/// Show recently played tracks
#[poise::command(slash_command, prefix_command, guild_only)]
pub async fn history(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data().orchestrator.show_history(guild_id.get())?;
    ctx.say("History posted").await?;
    Ok(())
}

/// Move future status messages to this channel
#[poise::command(slash_command, prefix_command, guild_only, rename = "move-messages")]
pub async fn move_messages(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    ctx.data()
        .orchestrator
        .move_messages(guild_id.get(), ctx.channel_id().get())?;
    ctx.say("Status messages will appear here from now on").await?;
    Ok(())
}

/// Queue random tracks from this server's history
#[poise::command(slash_command, prefix_command, guild_only, rename = "random-play")]
pub async fn random_play(
    ctx: Context<'_>,
    #[description = "Pick from the download cache instead of history"] cache: Option<bool>,
    #[description = "How many tracks to queue"] count: Option<usize>,
) -> Result<(), Error> {
    let requester = requester(&ctx)?;
    let voice_channel = user_voice_channel(&ctx)?;
    ctx.defer().await?;
    ctx.data()
        .orchestrator
        .random_play(
            requester,
            voice_channel.get(),
            cache.unwrap_or(false),
            count,
        )
        .await?;
    ctx.say("Queueing random tracks").await?;
    Ok(())
}

/// Persistent playlist management
#[poise::command(
    slash_command,
    prefix_command,
    guild_only,
    subcommands(
        "playlist_create",
        "playlist_list",
        "playlist_show",
        "playlist_delete",
        "playlist_rename",
        "playlist_item_add",
        "playlist_item_remove",
        "playlist_queue",
        "playlist_save_queue",
        "playlist_save_history",
        "playlist_merge"
    ),
    subcommand_required
)]
pub async fn playlist(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Create a new playlist
#[poise::command(slash_command, prefix_command, guild_only, rename = "create")]
pub async fn playlist_create(
    ctx: Context<'_>,
    #[description = "Playlist name"]
    #[rest]
    name: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_create(guild_id.get(), &name)
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// List this server's playlists
#[poise::command(slash_command, prefix_command, guild_only, rename = "list")]
pub async fn playlist_list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx.data().orchestrator.playlist_list(guild_id.get()).await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Show a playlist's items
#[poise::command(slash_command, prefix_command, guild_only, rename = "show")]
pub async fn playlist_show(
    ctx: Context<'_>,
    #[description = "Playlist number from /playlist list"] index: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_show(guild_id.get(), PlaylistSelector::Index(index))
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Delete a playlist
#[poise::command(slash_command, prefix_command, guild_only, rename = "delete")]
pub async fn playlist_delete(
    ctx: Context<'_>,
    #[description = "Playlist number from /playlist list"] index: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_delete(guild_id.get(), PlaylistSelector::Index(index))
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Rename a playlist
#[poise::command(slash_command, prefix_command, guild_only, rename = "rename")]
pub async fn playlist_rename(
    ctx: Context<'_>,
    #[description = "Playlist number from /playlist list"] index: usize,
    #[description = "New name"]
    #[rest]
    name: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_rename(guild_id.get(), PlaylistSelector::Index(index), &name)
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Add search results to a playlist
#[poise::command(slash_command, prefix_command, guild_only, rename = "item-add")]
pub async fn playlist_item_add(
    ctx: Context<'_>,
    #[description = "Playlist number from /playlist list"] index: usize,
    #[description = "URL or search text"]
    #[rest]
    search: String,
) -> Result<(), Error> {
    let requester = requester(&ctx)?;
    ctx.defer().await?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_item_add(requester, PlaylistSelector::Index(index), &search)
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Remove an item from a playlist
#[poise::command(slash_command, prefix_command, guild_only, rename = "item-remove")]
pub async fn playlist_item_remove(
    ctx: Context<'_>,
    #[description = "Playlist number from /playlist list"] index: usize,
    #[description = "Item number from /playlist show"] item: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_item_remove(guild_id.get(), PlaylistSelector::Index(index), item)
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Queue a playlist for playback
#[poise::command(slash_command, prefix_command, guild_only, rename = "queue")]
pub async fn playlist_queue(
    ctx: Context<'_>,
    #[description = "Playlist number, or 0 for history"] index: usize,
    #[description = "Shuffle before queueing"] shuffle: Option<bool>,
    #[description = "Maximum tracks to queue"] max: Option<usize>,
) -> Result<(), Error> {
    let requester = requester(&ctx)?;
    let voice_channel = user_voice_channel(&ctx)?;
    ctx.defer().await?;
    let selector = if index == 0 {
        PlaylistSelector::History
    } else {
        PlaylistSelector::Index(index)
    };
    ctx.data()
        .orchestrator
        .playlist_queue(
            requester,
            voice_channel.get(),
            selector,
            shuffle.unwrap_or(false),
            max,
        )
        .await?;
    ctx.say("Queueing playlist").await?;
    Ok(())
}

/// Save the current play queue as a playlist
#[poise::command(slash_command, prefix_command, guild_only, rename = "save-queue")]
pub async fn playlist_save_queue(
    ctx: Context<'_>,
    #[description = "Name for the new playlist"]
    #[rest]
    name: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_save_queue(guild_id.get(), &name, false)
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Save recent history as a playlist
#[poise::command(slash_command, prefix_command, guild_only, rename = "save-history")]
pub async fn playlist_save_history(
    ctx: Context<'_>,
    #[description = "Name for the new playlist"]
    #[rest]
    name: String,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_save_queue(guild_id.get(), &name, true)
        .await?;
    ctx.say(reply).await?;
    Ok(())
}

/// Merge one playlist's items into another
#[poise::command(slash_command, prefix_command, guild_only, rename = "merge")]
pub async fn playlist_merge(
    ctx: Context<'_>,
    #[description = "Source playlist number"] from: usize,
    #[description = "Destination playlist number"] into: usize,
) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be used in a server")?;
    let reply = ctx
        .data()
        .orchestrator
        .playlist_merge(
            guild_id.get(),
            PlaylistSelector::Index(from),
            PlaylistSelector::Index(into),
        )
        .await?;
    ctx.say(reply).await?;
    Ok(())
}
