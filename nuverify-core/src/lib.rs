//! nuverify core library: version resolution, instruction cache, and the
//! analysis pipeline for Nushell script compatibility checks.
//!
//! The main entry point is [`pipeline::Pipeline`], which runs
//! Scan → Resolve → Ensure instructions → Analyze → Report over a set of
//! script roots, backed by an [`cache::InstructionCache`].

pub mod analyzer;
pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod llm;
pub mod marker;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod resolve;
pub mod scan;
pub mod source;
pub mod types;
pub mod version;

use std::sync::Once;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the process-wide rustls crypto provider (aws-lc-rs).
///
/// `reqwest` is built without a default provider; call this before creating
/// any HTTP client. Safe to call more than once.
pub fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// HTTP client for the boundary collaborators, with the crypto provider in place.
pub(crate) fn http_client() -> reqwest::Client {
    install_crypto_provider();
    reqwest::Client::new()
}
