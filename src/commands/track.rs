use crate::{Context, Error};
use poise::serenity_prelude as serenity;
use tracing::info;

/// Manage channel context tracking
#[poise::command(
    slash_command,
    subcommands("enable", "disable", "status"),
    required_permissions = "MANAGE_CHANNELS",
    guild_only
)]
pub async fn track(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Start collecting context from this channel
#[poise::command(slash_command)]
pub async fn enable(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx.guild_id().ok_or("Must be run in a guild")?;
    let channel_id = ctx.channel_id().to_string();
    let engine = ctx.data().assistant.engine();

    if engine.is_channel_tracked(&channel_id) {
        ctx.say("ℹ️ This channel is already tracked.").await?;
        return Ok(());
    }
    engine
        .enable_channel(Some(&guild_id.to_string()), &channel_id)
        .await?;
    info!("Tracking enabled for channel {} by {}", channel_id, ctx.author().name);
    ctx.say("✅ Tracking enabled. New messages here will be used as context.")
        .await?;
    Ok(())
}

/// Stop collecting context from this channel
#[poise::command(slash_command)]
pub async fn disable(ctx: Context<'_>) -> Result<(), Error> {
    let channel_id = ctx.channel_id().to_string();
    let removed = ctx
        .data()
        .assistant
        .engine()
        .disable_channel(&channel_id)
        .await?;
    if removed {
        info!("Tracking disabled for channel {} by {}", channel_id, ctx.author().name);
        ctx.say("✅ Tracking disabled. Already indexed messages expire on their own.")
            .await?;
    } else {
        ctx.say("ℹ️ This channel was not being tracked.").await?;
    }
    Ok(())
}

/// Show context statistics for this channel
#[poise::command(slash_command)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let channel_id = ctx.channel_id().to_string();
    let Some(stats) = ctx
        .data()
        .assistant
        .engine()
        .get_channel_stats(&channel_id)
        .await
    else {
        ctx.say("📭 This channel is not tracked. Use `/track enable` to start.")
            .await?;
        return Ok(());
    };

    let indexed = stats
        .indexed_count
        .map(|n| format!("`{n}`"))
        .unwrap_or_else(|| "unavailable".to_string());
    let last_activity = stats
        .last_activity
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "Never".to_string());

    let embed = serenity::CreateEmbed::new()
        .title("🧠 Channel Context")
        .field("Buffered", format!("`{}`", stats.buffer_count), true)
        .field("Indexed", indexed, true)
        .field("Pending", format!("`{}`", stats.pending_count), true)
        .footer(serenity::CreateEmbedFooter::new(format!(
            "Last activity: {last_activity}"
        )))
        .color(0x5865F2);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}
