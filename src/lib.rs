//! Offline-first request cache and background sync engine for the Agri
//! Training client.
//!
//! Pages route their requests through [`engine::Engine::fetch`], which applies
//! a per-route caching strategy and always produces a response. Mutations made
//! while offline go through [`engine::Engine::submit`] into a durable queue
//! that is replayed in order once the API is reachable again.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod http;
pub mod interceptor;
pub mod logging;
pub mod network;
pub mod push;
pub mod strategy;
pub mod sync;

#[cfg(test)]
mod testing;
