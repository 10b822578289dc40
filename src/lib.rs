// webcache - embeddable layered cache for HTTP byte resources
//
// A caller asks for a URL (optionally a byte range); the cache streams the
// bytes back together with their metadata and transparently populates
// faster tiers from slower ones. Pipelines compose with `|`:
// `memory | file | http`.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod hash;
pub mod info;
pub mod layered;
pub mod policy;
pub mod progress;
pub mod receiver;
pub mod store;

pub use config::{CacheConfig, FileStoreConfig, MemoryStoreConfig};
pub use error::CacheError;
pub use fetcher::{FetcherConfig, HttpFetcher};
pub use info::{header_whitelist, set_header_whitelist, ResourceInfo, StorageInfo};
pub use layered::{LayeredCache, Node};
pub use policy::CachePolicy;
pub use progress::Progress;
pub use receiver::{BoxReceiver, BufferReceiver, FilterReceiver, NullReceiver, Receiver, ResponseHandle};
pub use store::{FileStore, MemoryStore, MutableStore, Source, Store};
