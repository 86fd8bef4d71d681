//! # DIDentity Server
//!
//! HTTP surface for the token lifecycle:
//!
//! | Method | Path | |
//! |--------|------|-|
//! | `POST` | `/signup` | JSON `{username, email, password}` |
//! | `POST` | `/login` | form `username`, `password` |
//! | `POST` | `/token/refresh` | JSON `{refresh_token}` |
//! | `POST` | `/token/revoke` | bearer token, plus `?token=` and/or JSON `{token}` |
//! | `GET` | `/token/verify` | bearer token |
//! | `GET` | `/health` | secret store health |

pub mod config;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use routes::create_router;
pub use server::AuthServer;
pub use state::AppState;
