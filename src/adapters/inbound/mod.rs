mod ws_server;

pub use ws_server::WsServer;
