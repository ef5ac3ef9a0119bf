mod types;
pub use types::*;

mod util;
pub use util::Activity;

pub mod h1;
pub mod h2;
pub mod ws;

mod dispatch;
pub use dispatch::Reply;

mod serve;
pub use serve::*;

/// re-exported so consumers can use whatever version we use
pub use http;

pub mod error;

#[allow(async_fn_in_trait)] // we never require Send
pub trait ServerDriver {
    /// Only ever logged, `Box<dyn std::error::Error>` will do
    type Error: std::fmt::Display;

    /// What a connection turns into when [Reply::WebSocket] is returned
    type WebSocket: ws::WebSocketHandler;

    /// Handles one complete request. `res` starts out as an empty `200`,
    /// the handler fills it in (or streams into it with
    /// [Response::stream]) and tells what to do with it.
    async fn handle(
        &self,
        req: Request,
        res: &mut Response,
    ) -> Result<Reply<Self::WebSocket>, Self::Error>;
}
