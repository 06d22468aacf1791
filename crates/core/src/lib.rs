//! `proxy-core`: the canonical model, dialect-transformer contracts, and
//! request-dispatch machinery for the LLM format-translating proxy (C1,
//! C3-C10). HTTP routing, CORS, config-file loading, and process bootstrap
//! are out of scope here — see the `gateway` binary crate.

pub mod cooldown;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod responses;
pub mod router;
pub mod schema;
pub mod signature_cache;
pub mod stream;
pub mod transformer;
