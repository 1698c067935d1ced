pub mod collector;
pub mod feed;
pub mod llm;
pub mod records;
pub mod script;
pub mod setup;
pub mod tts;
pub mod workflow;
