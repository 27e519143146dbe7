pub mod playlist;
pub mod vod;

pub use playlist::{SegmentProxy, fetch_playlist_text, is_manifest, rewrite_playlist};
pub use vod::{VodPlaylists, VodPolicy};
