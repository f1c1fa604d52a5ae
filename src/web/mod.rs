mod handlers;
mod routes;
mod ws;

pub use routes::{create_router, serve};
pub use ws::signaling_ws_handler;
