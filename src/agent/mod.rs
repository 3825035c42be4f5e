pub mod parse;
pub mod prompts;
pub mod provider;
