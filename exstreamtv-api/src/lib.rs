pub mod http;
pub mod lineup;
pub mod m3u;
pub mod xmltv;

pub use http::{create_router, AppState};
pub use lineup::{build_lineup, LineupEntry};
