//! Request handlers for the hub's HTTP and WebSocket endpoints

pub mod websocket;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use warp::Filter;

use crate::auth::provider::AuthProvider;
use crate::config::HubConfig;
use crate::core::router::SharedRouter;

pub use websocket::{handle_ws_client, TransportSettings};

/// All hub routes: `GET /<ws_path>?token=..`, `GET /health`, `GET /stats`
pub fn routes(
    router: SharedRouter,
    auth: Arc<dyn AuthProvider>,
    config: &HubConfig,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let settings = TransportSettings {
        auth_timeout: config.auth_timeout,
        send_timeout: config.send_timeout,
    };

    let ws_route = warp::path(config.ws_path.clone())
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("authorization"))
        .and(with_router(router.clone()))
        .and(with_auth(auth))
        .map(
            move |ws: warp::ws::Ws,
                  query: HashMap<String, String>,
                  header: Option<String>,
                  router: SharedRouter,
                  auth: Arc<dyn AuthProvider>| {
                log::debug!("New websocket upgrade request");
                let credential = query.get("token").cloned().or(header);
                ws.on_upgrade(move |socket| {
                    handle_ws_client(socket, credential, router, auth, settings)
                })
            },
        );

    let health_route = warp::path("health").and(warp::path::end()).map(|| "OK");

    let stats_route = warp::path("stats")
        .and(warp::path::end())
        .and(with_router(router))
        .map(|router: SharedRouter| warp::reply::json(&router.stats().snapshot()));

    ws_route.or(health_route).or(stats_route)
}

fn with_router(
    router: SharedRouter,
) -> impl Filter<Extract = (SharedRouter,), Error = Infallible> + Clone {
    warp::any().map(move || router.clone())
}

fn with_auth(
    auth: Arc<dyn AuthProvider>,
) -> impl Filter<Extract = (Arc<dyn AuthProvider>,), Error = Infallible> + Clone {
    warp::any().map(move || auth.clone())
}
