//! HTTP surface for branching chat sessions.
//!
//! Exposes the session store and the turn runner over axum: a streaming
//! chat endpoint (SSE), an abort endpoint that signals the running turn,
//! and plain JSON routes for view projection, the session document, stats,
//! and message CRUD.

pub mod http;
pub mod service;
pub mod sse;
