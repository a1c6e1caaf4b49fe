use super::{autocomplete_persona, conversation_channel};
use crate::assistant::{AdminOutcome, ChatOutcome, ChatRequest, ChatUser};
use crate::config::{DISCORD_EMBED_LIMIT, DISCORD_MESSAGE_LIMIT};
use crate::conversation::ConversationState;
use crate::{Context, Error};
use poise::serenity_prelude::{self as serenity, CreateEmbed, CreateEmbedFooter};

/// Chat with a persona
#[poise::command(slash_command)]
pub async fn chat(
    ctx: Context<'_>,
    #[description = "Persona to talk to"]
    #[autocomplete = "autocomplete_persona"]
    persona: String,
    #[description = "Your message"] message: String,
    #[description = "Optional image to show the persona"] image: Option<serenity::Attachment>,
) -> Result<(), Error> {
    ctx.defer().await?;
    let outcome = run_turn(ctx, &persona, &message, image, false).await;
    reply_with_outcome(&ctx, outcome).await
}

/// Pick an expired conversation back up
#[poise::command(slash_command)]
pub async fn resume(
    ctx: Context<'_>,
    #[description = "Persona to resume with"]
    #[autocomplete = "autocomplete_persona"]
    persona: String,
    #[description = "Your message"] message: String,
) -> Result<(), Error> {
    ctx.defer().await?;
    let outcome = run_turn(ctx, &persona, &message, None, true).await;
    reply_with_outcome(&ctx, outcome).await
}

/// Discard a persona's conversation history in this channel
#[poise::command(slash_command, required_permissions = "MANAGE_MESSAGES")]
pub async fn reset(
    ctx: Context<'_>,
    #[description = "Persona whose conversation to reset"]
    #[autocomplete = "autocomplete_persona"]
    persona: String,
) -> Result<(), Error> {
    let channel = conversation_channel(&ctx);
    let outcome = ctx
        .data()
        .assistant
        .reset_conversation(&channel, &persona)
        .await;
    reply_with_admin(&ctx, outcome).await
}

/// Expire a persona's conversation in this channel, keeping its history
#[poise::command(slash_command, required_permissions = "MANAGE_MESSAGES")]
pub async fn expire(
    ctx: Context<'_>,
    #[description = "Persona whose conversation to expire"]
    #[autocomplete = "autocomplete_persona"]
    persona: String,
) -> Result<(), Error> {
    let channel = conversation_channel(&ctx);
    let outcome = ctx
        .data()
        .assistant
        .expire_conversation(&channel, &persona)
        .await;
    reply_with_admin(&ctx, outcome).await
}

/// Show the state of a persona's conversation in this channel
#[poise::command(slash_command)]
pub async fn status(
    ctx: Context<'_>,
    #[description = "Persona to check"]
    #[autocomplete = "autocomplete_persona"]
    persona: String,
) -> Result<(), Error> {
    let channel = conversation_channel(&ctx);
    let outcome = ctx
        .data()
        .assistant
        .conversation_status(&channel, &persona)
        .await;
    let Some(state) = outcome.state.filter(|_| outcome.success) else {
        let error = outcome
            .error
            .unwrap_or_else(|| "Something went wrong.".to_string());
        ctx.say(format!("❌ {error}")).await?;
        return Ok(());
    };

    let Some(summary) = outcome.conversation else {
        ctx.say(format!(
            "📭 No conversation with `{persona}` here yet. Use `/chat` to start one."
        ))
        .await?;
        return Ok(());
    };

    let config = &ctx.data().config;
    let label = match state {
        ConversationState::Active => "🟢 Active",
        ConversationState::Idle => "🟡 Idle",
        ConversationState::Expired => "⏸️ Expired (use `/resume`)",
        ConversationState::Reset => "🔄 Reset (use `/chat`)",
        ConversationState::Absent => "📭 None",
    };
    let embed = CreateEmbed::new()
        .title(format!("💬 Conversation with {persona}"))
        .field("State", label, true)
        .field(
            "Messages",
            format!(
                "`{}` / `{}`",
                summary.message_count, config.conversation_max_messages
            ),
            true,
        )
        .field(
            "Tokens",
            format!(
                "`{}` / `{}`",
                summary.total_tokens, config.conversation_max_tokens
            ),
            true,
        )
        .footer(CreateEmbedFooter::new(format!(
            "Last activity: {}",
            summary.last_activity.format("%Y-%m-%d %H:%M UTC")
        )))
        .color(0x5865F2);
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

/// List available personas
#[poise::command(slash_command)]
pub async fn personas(ctx: Context<'_>) -> Result<(), Error> {
    let registry = ctx.data().assistant.personas();
    let mut embed = CreateEmbed::new()
        .title("🎭 Personas")
        .color(0x5865F2)
        .footer(CreateEmbedFooter::new("Use /chat persona:<id> to start talking"));
    for persona in registry.iter() {
        embed = embed.field(
            format!("{} (`{}`)", persona.name(), persona.id()),
            persona.description().unwrap_or("No description"),
            false,
        );
    }
    ctx.send(poise::CreateReply::default().embed(embed)).await?;
    Ok(())
}

async fn run_turn(
    ctx: Context<'_>,
    persona: &str,
    message: &str,
    image: Option<serenity::Attachment>,
    resume: bool,
) -> ChatOutcome {
    let user = ChatUser {
        id: ctx.author().id.to_string(),
        name: ctx.author().name.clone(),
    };
    let channel_id = ctx.guild_id().map(|_| ctx.channel_id().to_string());
    let guild_id = ctx.guild_id().map(|g| g.to_string());
    let image_url = image
        .filter(|a| {
            a.content_type
                .as_deref()
                .is_some_and(|t| t.starts_with("image/"))
        })
        .map(|a| a.url);

    let request = ChatRequest {
        persona_id: persona,
        message,
        user: &user,
        channel_id: channel_id.as_deref(),
        guild_id: guild_id.as_deref(),
        image_url: image_url.as_deref(),
    };
    let assistant = &ctx.data().assistant;
    if resume {
        assistant.resume_chat(request).await
    } else {
        assistant.chat(request).await
    }
}

async fn reply_with_outcome(ctx: &Context<'_>, outcome: ChatOutcome) -> Result<(), Error> {
    if !outcome.success {
        let error = outcome
            .error
            .unwrap_or_else(|| "Something went wrong.".to_string());
        ctx.say(format!("❌ {error}")).await?;
        return Ok(());
    }

    let text = outcome.message.unwrap_or_default();
    let footer = outcome.conversation.map(|c| {
        format!(
            "{} messages · {} tokens this turn",
            c.message_count,
            outcome.tokens.unwrap_or_default()
        )
    });
    send_response(ctx, &text, footer.as_deref()).await?;

    for artifact in outcome.artifacts {
        ctx.say(format!("📎 {}: {}", artifact.kind, artifact.url))
            .await?;
    }
    Ok(())
}

async fn reply_with_admin(ctx: &Context<'_>, outcome: AdminOutcome) -> Result<(), Error> {
    let text = if outcome.success {
        format!("✅ {}", outcome.message.unwrap_or_default())
    } else {
        format!(
            "❌ {}",
            outcome
                .error
                .unwrap_or_else(|| "Something went wrong.".to_string())
        )
    };
    ctx.send(poise::CreateReply::default().content(text).ephemeral(true))
        .await?;
    Ok(())
}

/// Send response, using embeds for long messages
async fn send_response(
    ctx: &Context<'_>,
    content: &str,
    footer: Option<&str>,
) -> Result<(), Error> {
    if content.chars().count() <= DISCORD_MESSAGE_LIMIT && footer.is_none() {
        ctx.say(content).await?;
        return Ok(());
    }

    let chunks = split_chunks(content, DISCORD_EMBED_LIMIT - 100);
    let total = chunks.len();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let mut embed = CreateEmbed::new().description(chunk).color(0x5865F2);
        if total > 1 {
            embed = embed.title(format!("Part {}/{}", i + 1, total));
        }
        if let (Some(footer), true) = (footer, i + 1 == total) {
            embed = embed.footer(CreateEmbedFooter::new(footer));
        }
        ctx.send(poise::CreateReply::default().embed(embed)).await?;
    }
    Ok(())
}

/// Splits on char boundaries, preferring the last newline inside each chunk.
fn split_chunks(content: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = content.chars().collect();

    while rest.len() > max_chars {
        let window = &rest[..max_chars];
        let cut = window
            .iter()
            .rposition(|c| *c == '\n')
            .filter(|&pos| pos > max_chars / 2)
            .map(|pos| pos + 1)
            .unwrap_or(max_chars);
        chunks.push(rest[..cut].iter().collect());
        rest.drain(..cut);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.into_iter().collect());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunks_respects_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = split_chunks(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_chunks_prefers_newlines() {
        let text = format!("{}\n{}", "a".repeat(8), "b".repeat(8));
        let chunks = split_chunks(&text, 12);
        assert_eq!(chunks[0], format!("{}\n", "a".repeat(8)));
        assert_eq!(chunks[1], "b".repeat(8));
    }

    #[test]
    fn test_split_chunks_short_and_empty() {
        assert_eq!(split_chunks("hi", 10), vec!["hi".to_string()]);
        assert_eq!(split_chunks("", 10), vec![String::new()]);
    }
}
