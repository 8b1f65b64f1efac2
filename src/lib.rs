mod config;
mod errors;
mod geocode;
mod intermediate;
mod kv;
mod pipeline;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{AppConfig, DEFAULT_GEOCODER_ENDPOINT};
pub use errors::{AppError, AppResult};
pub use geocode::{Address, Geocoder, ResolutionCache};
pub use intermediate::{
    batch_iter, BatchIter, IntermediateReader, IntermediateWriter, RecordIter, DEFAULT_CHUNK_SIZE,
};
pub use kv::KvStore;
pub use pipeline::{CoordinateRecord, ResolvedRecord, ResolverPipeline};

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,geo_resolve=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
