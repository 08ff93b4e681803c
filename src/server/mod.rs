//! HTTP chat API
//!
//! Exposes any [`Completer`](crate::engine::Completer) over two JSON
//! endpoints under `/api/chat`.

mod handlers;
mod serve;

pub use handlers::{router, ERROR_BAD_REQUEST, ERROR_INTERNAL, ERROR_NO_RESPONSE, GENERATE_PATH, HEALTH_PATH};
pub use serve::{serve, ServeHandle};
