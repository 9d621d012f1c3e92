//! Supabase-compatible backend for the chat runtime.
//!
//! The HTTP and websocket clients live behind [`ChatBackend`]; the async
//! command loop in [`runtime`] drives them and publishes `ChatEvent`s.

/// GoTrue phone OTP and session endpoints.
pub mod auth;
/// `ChatBackend` trait and the production implementation.
pub mod backend;
pub mod geo;
pub mod gif;
mod http;
/// Phoenix websocket change subscription.
pub mod realtime;
/// PostgREST access to the `messages` table.
pub mod rest;
pub mod runtime;
pub mod storage;

pub use auth::{AuthApi, AuthUser, UserMetadata};
pub use backend::{ChatBackend, SupabaseBackend, SupabaseBackendConfig};
pub use geo::{DEFAULT_GEO_URL, GeoClient};
pub use gif::{DEFAULT_GIF_LIMIT, TENOR_BASE_URL, TenorClient};
pub use http::SupabaseConfig;
pub use realtime::{CHANNEL_TOPIC, RealtimeClient, RealtimeSignal, SubscriptionGuard};
pub use rest::{MessagesApi, PageQuery};
pub use runtime::{ChatRuntimeHandle, DEFAULT_PAGE_SIZE, spawn_runtime};
pub use storage::{DEFAULT_IMAGE_BUCKET, StorageApi, public_url};
