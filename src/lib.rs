//! wallflow mirrors VK group walls into Telegram channels.
//!
//! The flow is two pipelines over one SQLite store: ingestion pulls wall
//! pages, parses them and persists anything not seen before; publishing
//! drains the unpublished backlog into the destination channel, oldest post
//! first. Both network seams are traits so the pipelines test against mocks.

pub mod cli;
pub mod config;
pub mod contract;
pub mod format;
pub mod pipeline;
pub mod store;
pub mod telegram;
pub mod vk;
