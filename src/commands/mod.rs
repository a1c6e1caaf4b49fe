pub mod chat;
pub mod history;
pub mod track;

use crate::assistant::resolve_channel;
use crate::Context;

/// Conversation channel for a command invocation; DMs key on the user.
pub(crate) fn conversation_channel(ctx: &Context<'_>) -> String {
    let channel = ctx.guild_id().map(|_| ctx.channel_id().to_string());
    resolve_channel(channel.as_deref(), &ctx.author().id.to_string())
}

pub(crate) async fn autocomplete_persona<'a>(
    ctx: Context<'_>,
    partial: &'a str,
) -> impl Iterator<Item = String> + 'a {
    let partial = partial.to_lowercase();
    let ids: Vec<String> = ctx
        .data()
        .assistant
        .personas()
        .ids()
        .into_iter()
        .filter(|id| id.contains(&partial))
        .collect();
    ids.into_iter()
}
