pub mod archive;
pub mod assistant;
pub mod cache;
pub mod commands;
pub mod config;
pub mod context;
pub mod conversation;
pub mod db;
pub mod facts;
pub mod indexer;
pub mod llm;
pub mod message;
pub mod persona;
pub mod rag;
pub mod services;
pub mod system_prompt;

#[cfg(test)]
mod testing;

/// Custom data passed to all commands
pub struct Data {
    pub config: config::Config,
    pub assistant: std::sync::Arc<assistant::Assistant>,
    pub archive: std::sync::Arc<archive::HistoryArchive>,
}

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
