//! Development backend for the `group_chat_messages` table: a REST surface for
//! row operations plus a WebSocket change feed filtered by `group_id`.

mod app_state;
pub mod config;
mod routes;

pub use app_state::AppState;
pub use routes::build_router;

#[cfg(test)]
#[path = "tests/routes_tests.rs"]
mod routes_tests;
