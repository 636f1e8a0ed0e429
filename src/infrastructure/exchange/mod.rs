pub mod kraken;
pub mod pairs;
pub mod websocket;

pub use kraken::KrakenRest;
pub use websocket::{KrakenWebSocket, WsEvent};
