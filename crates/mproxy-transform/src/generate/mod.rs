//! Inbound→outbound request transforms. One module per pair; all pure.

pub mod openai2anthropic;
pub mod openai2google;
pub mod openai2mistral;
pub mod text2chat;
