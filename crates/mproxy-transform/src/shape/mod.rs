//! Outbound→inbound response shaping for blocking responses. Streaming
//! bodies are forwarded verbatim; only the synthetic aggregate goes through
//! these when billing needs it.

pub mod anthropic2openai;
pub mod awstext2openai;
pub mod chat2text;
pub mod google2openai;
pub mod responses2openai;
