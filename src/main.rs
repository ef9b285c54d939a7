#[macro_use]
extern crate log;

mod jamsync;
mod routes;

#[cfg(test)]
mod tests;

use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;

use actix_cors::Cors;
use actix_governor::{Governor, GovernorConfigBuilder};
use actix_web::middleware;
use actix_web::{App, HttpResponse, HttpServer, middleware::Logger, web};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::sync::RwLock;

use jamsync::config::Config;
use jamsync::gateway::JamsyncWsInstance;
use jamsync::health::HealthMonitor;
use jamsync::registry::{RoomRegistry, SharedRegistry};

const DEFAULT_SOCKET_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(0, 0, 0, 0), 3200);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    env_logger::init_from_env(env_logger::Env::new().filter_or("LOG", "debug"));

    let is_prod = dotenvy::var("IS_PROD")
        .map(|s| &s == "true")
        .unwrap_or(false);

    let socket = (
        IpAddr::from(
            Ipv4Addr::from_str(&dotenvy::var("HOST").unwrap_or("".to_owned()))
                .unwrap_or(DEFAULT_SOCKET_ADDR.0),
        ),
        dotenvy::var("PORT")
            .map(|s| s.parse().expect("Failed to parse PORT env to valid u16"))
            .unwrap_or(DEFAULT_SOCKET_ADDR.1),
    );

    serve(socket, is_prod).await
}

// Split from main so tests can run the server on a port of their own
pub(crate) async fn serve(socket: (IpAddr, u16), is_prod: bool) -> std::io::Result<()> {
    let config = Config::from_env();
    let registry: SharedRegistry = Arc::new(RwLock::new(RoomRegistry::new(config.clone())));

    HealthMonitor::new(Arc::clone(&registry), config.clone()).spawn();

    // TODO: If behind a (reverse) proxy, change the key extractor because the peer IP will be the same
    // https://docs.rs/actix-governor/latest/actix_governor/struct.PeerIpKeyExtractor.html
    let governor_conf = GovernorConfigBuilder::default()
        .burst_size(50)
        .seconds_per_request(1)
        .finish()
        .expect("Failed to build governor (rate limiter)");

    let app_registry = Arc::clone(&registry);
    let app_config = config.clone();

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::new("%a/%{r}a %r status %s %Dms").exclude("/v1/ws"))
            .wrap(Cors::permissive()) // TODO prod: Change this
            .wrap(middleware::Compress::default())
            .wrap(Governor::new(&governor_conf))
            .app_data(web::Data::new(Arc::clone(&app_registry)))
            .app_data(web::Data::new(app_config.clone()))
            .default_service(web::to(HttpResponse::NotFound))
            .service(routes::root)
            .service(routes::create_room)
            .service(routes::delete_room)
            .service(routes::get_room)
            .service(routes::get_playlist)
            .service(routes::get_playback)
            .service(routes::update_settings)
            .service(routes::stats)
            .service(web::resource("/v1/ws").route(web::get().to(JamsyncWsInstance::init)))
    });

    match is_prod {
        true => {
            let key_path = dotenvy::var("TLS_PRIVATE_KEY").expect("TLS_PRIVATE_KEY env not found");
            let cert_path = dotenvy::var("TLS_CERT_KEY").expect("TLS_CERT_KEY env not found");

            let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;

            builder.set_private_key_file(&key_path, SslFiletype::PEM)?;
            builder.set_certificate_chain_file(&cert_path)?;

            server.bind_openssl(socket, builder)?.run().await?;
        }
        false => {
            server.bind(socket)?.run().await?;
        }
    }

    // Drain every room before the process goes away.
    registry.write().await.shutdown_all().await;

    Ok(())
}
