use argh::FromArgs;
use chartqa_infernum::{
    ChartQaService, ServiceConfig,
    config::DEFAULT_GENERATION_TIMEOUT,
    normalizer::DEFAULT_MAX_DIMENSION,
    qwen2_vl::{DEFAULT_MODEL_ID, LoadOptions, Qwen2VlModel},
    server,
};
use std::{path::PathBuf, sync::Arc};

// defaults for the server
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5001;

#[derive(FromArgs)]
/// Serves chart question answering over HTTP.
struct ServerArgs {
    /// the host to run the server on
    #[argh(option, short = 'h', default = "DEFAULT_HOST.to_string()")]
    host: String,

    /// the port to run the server on
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// hub id of the base model
    #[argh(option, default = "DEFAULT_MODEL_ID.to_string()")]
    model_id: String,

    /// local directory holding the base checkpoint; downloaded when omitted
    #[argh(option)]
    model_dir: Option<PathBuf>,

    /// directory holding adapter_config.json and adapter_model.safetensors
    #[argh(option)]
    adapter_dir: PathBuf,

    /// largest image side passed to the model
    #[argh(option, default = "DEFAULT_MAX_DIMENSION")]
    max_dimension: u32,

    /// generation timeout in seconds, 0 waits forever
    #[argh(option, default = "DEFAULT_GENERATION_TIMEOUT.as_secs()")]
    timeout_secs: u64,

    /// fix the sampling seed
    #[argh(option)]
    seed: Option<u64>,

    /// run on the CPU even when an accelerator is available
    #[argh(switch)]
    cpu: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: ServerArgs = argh::from_env();

    // format the host and port
    let addr = format!("{}:{}", args.host, args.port);

    let options = LoadOptions {
        model_id: args.model_id,
        model_dir: args.model_dir,
        adapter_dir: args.adapter_dir,
        force_cpu: args.cpu,
    };
    log::info!("Loading {} with adapter {}", options.model_id, options.adapter_dir.display());
    let model = match tokio::task::spawn_blocking(move || Qwen2VlModel::load(&options)).await? {
        Ok(model) => model,
        Err(err) => {
            log::error!("Failed to load model: {err}");
            std::process::exit(1);
        }
    };

    let mut config = ServiceConfig::default().with_timeout_secs(args.timeout_secs);
    config.max_dimension = args.max_dimension;
    config.sampling.seed = args.seed;

    let service = Arc::new(ChartQaService::new(model, &config));
    let app = server::router(service, config.max_request_bytes);

    log::info!("🚀 Starting the server");
    log::info!("🔥 Listening on: {}", addr);
    log::info!("🔧 Press Ctrl+C to stop the server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
