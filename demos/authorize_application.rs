//! Registers an application, prints its consent URL, and completes the callback.
//!
//! Run once to get the URL, then run again with the full redirect URL as the only argument:
//! `cargo run --example authorize_application -- "http://localhost:8080/callback?code=...&state=..."`.

// std
use std::{env, sync::Arc};
// crates.io
use color_eyre::Result;
use url::Url;
// self
use livechat_broker::{
	events::TracingSink,
	http::ReqwestHttpClient,
	lifecycle::{AccountLookup, CallbackParams, TokenLifecycle, TokenLifecycleOptions},
	oauth::{ReqwestTokenEndpoint, UserInfoLookup},
	provider::ProviderDescriptor,
	registry::{ApplicationRegistry, NewApplication, QuotaSettings},
	store::FileStore,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let store = Arc::new(FileStore::open(env::temp_dir().join("livechat-broker-demo"))?);
	let registry = Arc::new(ApplicationRegistry::new(store, "applications.json"));

	registry.load().await;

	let app = match registry.list().into_iter().find(|app| app.name == "Demo") {
		Some(app) => app,
		None =>
			registry
				.add(NewApplication {
					name: "Demo".into(),
					client_id: env::var("DEMO_CLIENT_ID").unwrap_or_else(|_| "demo-client".into()),
					client_secret: env::var("DEMO_CLIENT_SECRET")
						.unwrap_or_else(|_| "demo-secret".into()),
					quota_settings: QuotaSettings::default(),
				})
				.await?,
	};
	let descriptor = ProviderDescriptor::youtube(Url::parse("http://localhost:8080/callback")?)?;
	let endpoint = Arc::new(ReqwestTokenEndpoint::new(descriptor.clone())?);
	let mut options =
		TokenLifecycleOptions::new(registry.clone(), endpoint, descriptor.clone(), Arc::new(TracingSink));

	options.account_lookup = UserInfoLookup::from_descriptor(&descriptor, ReqwestHttpClient::new()?)
		.map(|lookup| Arc::new(lookup) as Arc<dyn AccountLookup>);

	let lifecycle = TokenLifecycle::new(options);

	lifecycle.initialize(&registry.list()).await;

	let Some(redirect) = env::args().nth(1) else {
		let request = lifecycle.start_authorization(&app.id)?;

		println!("Open {} and approve access for `{}`.", request.url, app.name);
		println!("Then rerun this demo with the URL the browser was redirected to.");

		return Ok(());
	};
	let redirect = Url::parse(&redirect)?;
	let mut params = CallbackParams::default();

	for (key, value) in redirect.query_pairs() {
		match key.as_ref() {
			"code" => params.code = Some(value.into_owned()),
			"state" => params.state = Some(value.into_owned()),
			"error" => params.error = Some(value.into_owned()),
			_ => {},
		}
	}

	let application_id = lifecycle.handle_auth_callback(params).await?;
	let ready = lifecycle.refresh_application_token(&application_id).await;

	println!("Application {application_id} authorized; ready: {ready}.");

	lifecycle.destroy();

	Ok(())
}
