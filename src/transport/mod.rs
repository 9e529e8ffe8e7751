//! Network seams: HTTP for queries and mutations, WebSocket for
//! subscriptions. Both are traits so tests can script the other side.

mod http;
mod ws;

pub use http::{merge_headers, HttpReply, HttpTransport, ReqwestTransport};
pub use ws::{ws_endpoint, TungsteniteConnector, WsConnection, WsConnector};
