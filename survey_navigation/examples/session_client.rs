use std::path::PathBuf;

use clap::Parser;
use reqwest_middleware::ClientBuilder;
use survey_navigation::{Navigation, NavigationGuard};
use survey_reqwest::{SameOrigin, SessionMiddleware};
use survey_tokens::{
    refresh::{HttpRefreshExchange, DEFAULT_REFRESH_PATH},
    store::FileTokenStore,
    AccessToken, RefreshCoordinator, RefreshToken, Session, SessionWatcher, WatchConfig,
};

#[derive(Debug, Parser)]
struct Opts {
    /// The origin of the survey API
    #[arg(short, long, env, default_value = "http://localhost:8080")]
    api_url: reqwest::Url,

    /// The local file used to persist session tokens
    #[arg(short = 'f', long, env, default_value = ".session.json")]
    token_file: PathBuf,

    /// The page to navigate to
    #[arg(short, long, env, default_value = "/profile")]
    route: String,

    /// The API path to request once navigation is admitted
    #[arg(short = 'p', long, env, default_value = "/users/me")]
    request_path: String,

    /// An access token to log in with
    #[arg(long, env, hide_env_values = true)]
    access_token: Option<String>,

    /// A refresh token to log in with
    #[arg(long, env, hide_env_values = true)]
    refresh_token: Option<String>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let session = Session::open(FileTokenStore::new(&opts.token_file)).await;

    let mut events = session.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(?event, "auth event");
        }
    });

    if let Some(access_token) = opts.access_token {
        let authenticated = session
            .login(
                AccessToken::new(access_token),
                opts.refresh_token.map(RefreshToken::new),
            )
            .await?;
        tracing::info!(authenticated, "logged in with supplied tokens");
    }

    let exchange = HttpRefreshExchange::from_base_url(
        reqwest::Client::new(),
        &opts.api_url,
        DEFAULT_REFRESH_PATH,
    )?;
    let coordinator = RefreshCoordinator::new(session.clone(), exchange);
    let watcher = SessionWatcher::spawn(coordinator.clone(), WatchConfig::default());

    let guard = NavigationGuard::new(coordinator.clone());
    match guard.before_each(&opts.route).await {
        Navigation::Proceed => tracing::info!(route = %opts.route, "navigation admitted"),
        Navigation::Redirect(to) => {
            tracing::warn!(route = %opts.route, redirect_to = %to, "navigation denied");
            watcher.shutdown();
            return Ok(());
        }
    }

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(SessionMiddleware::new(coordinator).with_predicate(SameOrigin::new(&opts.api_url)))
        .build();

    let resp = client
        .get(opts.api_url.join(&opts.request_path)?)
        .send()
        .await?;
    let status = resp.status();
    let body = resp.text().await?;

    tracing::info!(
        status = status.as_u16(),
        authenticated = session.is_authenticated(),
        body_len = body.len(),
        "api response"
    );

    watcher.shutdown();
    Ok(())
}
