use anyhow::{bail, Context};

use geo_resolve::{AppConfig, KvStore, ResolverPipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    geo_resolve::init_tracing();

    let mut args = std::env::args().skip(1);
    let (Some(input_ns), Some(output_ns)) = (args.next(), args.next()) else {
        bail!("usage: geo-resolve <input-namespace> <output-namespace>");
    };

    let config = AppConfig::from_env();
    let kv = KvStore::open(&config.database_file_name)
        .with_context(|| format!("opening store {}", config.database_file_name))?;

    ResolverPipeline::new(kv, config)
        .run(&input_ns, &output_ns)
        .await
        .context("resolution run failed")?;
    Ok(())
}
