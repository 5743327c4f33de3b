//! Teams Moderator: policy-driven moderation for chat channels.

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod moderation;
pub mod notify;
pub mod pipeline;
pub mod platform;
pub mod policy;
pub mod text;
