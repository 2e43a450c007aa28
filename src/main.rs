// Relay server for the browser chat widget.
//
// Reads its settings from the environment (or a `.env` file), refuses to
// start when any required variable is missing, then serves:
// * GET  /          banner
// * GET  /messages  the chat log, read from the issue's comments
// * POST /messages  {displayName?, message}, appended as a new comment

use std::{process, sync::Arc};

use chat_relay::{api, Config, GithubCommentStore, Relay};

const DEFAULT_LOG_FILTER: &str = "chat_relay=info,warp=info";

fn init_logging() {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_owned());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();
}

#[tokio::main]
async fn main() {
    // a missing .env file is fine
    dotenvy::dotenv().ok();
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("chat-relay: {}", e);
            eprintln!("required: ACCESS_TOKEN, STORE_OWNER, STORE_REPO, THREAD_ID");
            process::exit(1);
        }
    };
    let store = match GithubCommentStore::new(&config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("chat-relay: {}", e);
            process::exit(1);
        }
    };

    log::info!("relaying chat to {}", store.comments_url());
    log::info!(
        "posts limited to {} per {} per address",
        config.rate_limit.max_requests,
        humantime::format_duration(config.rate_limit.window)
    );

    let relay = Arc::new(Relay::new(&config, Arc::new(store)));
    let routes = api::build_filters(relay, &config.allowed_origin, config.static_dir.clone());

    log::info!("listening on port {}", config.port);
    warp::serve(routes).run(([0, 0, 0, 0], config.port)).await;
}
