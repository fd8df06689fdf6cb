use std::net::SocketAddr;

use dicom_relay::config::AppConfig;
use dicom_relay::sweep::Sweeper;
use dicom_relay::AppState;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

fn init_logger(level: tracing::Level) -> Result<(), anyhow::Error> {
	let subscriber = tracing_subscriber::fmt()
		.compact()
		.with_file(true)
		.with_line_number(true)
		.with_target(false)
		.with_env_filter(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
	let config = AppConfig::new()?;
	init_logger(config.logging.level)?;

	let (state, scp) = AppState::wire(config)?;

	// Inbound C-STOREs (C-MOVE sub-operations) need the Storage-SCP up
	// before the first retrieve starts.
	let store_scp = scp;
	tokio::spawn(async move {
		if let Err(err) = store_scp.spawn().await {
			error!("Storage SCP terminated: {err}");
		}
	});

	let sweeper = Sweeper::from_config(state.cache.clone(), &state.config.dicom.cache);
	let _scheduler = sweeper.schedule(&state.config.dicom.cache).await?;

	let address = SocketAddr::from((state.config.http.interface, state.config.http.port));
	info!("Starting HTTP server on http://{address}");

	let router = dicom_relay::api::router(state);
	let listener = tokio::net::TcpListener::bind(address).await?;
	axum::serve(listener, router).await?;

	Ok(())
}
