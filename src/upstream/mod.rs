pub mod headers;
pub mod relay;

pub use headers::{sanitize_for_client, sanitize_for_upstream};
pub use relay::{HttpRelay, RelayConfig, UpstreamResponse};
