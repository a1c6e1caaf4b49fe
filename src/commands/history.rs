use crate::archive::ArchiveFilter;
use crate::config::DISCORD_EMBED_LIMIT;
use crate::{Context, Error};
use poise::serenity_prelude::{self as serenity, CreateEmbed, CreateEmbedFooter};
use std::path::Path;
use tracing::{info, warn};

/// Per-hit quote length, keeping five hits inside one embed.
const QUOTE_CHARS: usize = 600;

/// Search the old IRC archive
#[poise::command(slash_command, subcommands("search", "import", "stats"))]
pub async fn history(_ctx: Context<'_>) -> Result<(), Error> {
    Ok(())
}

/// Find archived IRC conversations
#[poise::command(slash_command)]
pub async fn search(
    ctx: Context<'_>,
    #[description = "What the conversation was about"] query: String,
    #[description = "Only conversations from this year"] year: Option<i32>,
    #[description = "Only conversations this member took part in"] user: Option<serenity::User>,
    #[description = "Only conversations with this IRC nick"] nick: Option<String>,
    #[description = "Only this IRC channel, e.g. #retro"] channel: Option<String>,
    #[description = "Words that must appear"] keyword: Option<String>,
) -> Result<(), Error> {
    ctx.defer().await?;
    let archive = &ctx.data().archive;

    let mut nicks: Vec<String> = nick.into_iter().collect();
    if let Some(user) = &user {
        let mapped = archive.nicks().nicks_for(&user.id.to_string());
        if mapped.is_empty() {
            ctx.say(format!("📭 No IRC nicks are mapped to {}.", user.name))
                .await?;
            return Ok(());
        }
        nicks.extend(mapped.iter().cloned());
    }

    let mut filter = ArchiveFilter::default().with_participants(nicks);
    if let Some(year) = year {
        filter = filter.with_year(year);
    }
    if let Some(channel) = channel.filter(|c| !c.trim().is_empty()) {
        filter = filter.with_channel(channel.trim());
    }
    if let Some(keyword) = keyword.filter(|k| !k.trim().is_empty()) {
        filter = filter.with_keyword(keyword.trim());
    }

    info!("History search '{}' by {}", query, ctx.author().name);
    let hits = match archive.search(&query, filter).await {
        Ok(hits) => hits,
        Err(e) => {
            warn!("History search failed: {}", e);
            ctx.say("❌ The archive is unavailable right now. Please try again later.")
                .await?;
            return Ok(());
        }
    };
    if hits.is_empty() {
        ctx.say("📭 Nothing in the archive matches that.").await?;
        return Ok(());
    }

    let mut body = String::new();
    for hit in &hits {
        let entry = archive.describe(hit, QUOTE_CHARS);
        if body.chars().count() + entry.chars().count() + 2 > DISCORD_EMBED_LIMIT {
            break;
        }
        body.push_str(&entry);
        body.push_str("\n\n");
    }

    let embed = CreateEmbed::new()
        .title(format!("📜 Archive: {query}"))
        .description(body.trim_end())
        .footer(CreateEmbedFooter::new(format!("{} matches", hits.len())))
        .color(0x5865F2);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// Import mIRC logs from the configured directory (Owner only)
#[poise::command(slash_command, owners_only)]
pub async fn import(ctx: Context<'_>) -> Result<(), Error> {
    let Some(dir) = ctx.data().config.history_log_dir.clone() else {
        ctx.say("ℹ️ `HISTORY_LOG_DIR` is not set, so there is nothing to import.")
            .await?;
        return Ok(());
    };
    ctx.defer().await?;

    info!("History import from {} started by {}", dir, ctx.author().name);
    match ctx.data().archive.ingest_dir(Path::new(&dir)).await {
        Ok(report) => {
            ctx.say(format!(
                "✅ Imported {} chunks from {} sessions in {} files ({} unreadable).",
                report.indexed, report.sessions, report.files, report.unreadable
            ))
            .await?;
        }
        Err(e) => {
            warn!("History import failed: {}", e);
            ctx.say(format!("❌ Import failed: {e}")).await?;
        }
    }
    Ok(())
}

/// Show archive size and nick mappings
#[poise::command(slash_command)]
pub async fn stats(ctx: Context<'_>) -> Result<(), Error> {
    let archive = &ctx.data().archive;
    let chunks = match archive.count().await {
        Ok(n) => format!("`{n}`"),
        Err(e) => {
            warn!("History count failed: {}", e);
            "unavailable".to_string()
        }
    };
    let embed = CreateEmbed::new()
        .title("📜 IRC Archive")
        .field("Chunks", chunks, true)
        .field("Mapped members", format!("`{}`", archive.nicks().len()), true)
        .color(0x5865F2);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}
