pub mod dispatcher;
pub mod forwarder;
pub mod routes;
pub mod server;

pub use dispatcher::GatewayDispatcher;
pub use forwarder::{ForwardError, Forwarder, HttpForwarder};
pub use routes::{Route, RouteTable};
pub use server::{build_router, serve, ServerState};
