//! Main executable that runs the HTTP front end for the job queues.

use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use log::{debug, error, info};

use callqueue::application::QueueManager;
use callqueue::config::{parse_config_from_cli_args, ServerConfig};
use callqueue::handlers;
use callqueue::service::JobService;

/// Default maximum size of a submitted job payload.
const DEFAULT_MAX_BODY_SIZE: usize = 256 * 1024;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // parse CLI arguments and configuration file
    let config = parse_config_from_cli_args();

    init_logging(&config.server);

    let manager = match QueueManager::connect(&config).await {
        Ok(manager) => Arc::new(manager),
        Err(err) => {
            eprintln!("Failed to connect to Redis: {}", err);
            std::process::exit(1);
        }
    };
    let service = JobService::new(manager);

    let max_body_size = config.server.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE);
    debug!("Setting max body size to {} bytes", max_body_size);

    // Set up HTTP server routing. Each endpoint has access to the JobService, through which all
    // queue operations are performed.
    let app_service = service.clone();
    let mut http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_service.clone()))
            // malformed bodies, query strings and paths still get the response envelope
            .app_data(handlers::json_config(max_body_size))
            .app_data(handlers::query_config())
            .app_data(handlers::path_config())
            // run basic health check by pinging Redis
            .route("/health", web::get().to(handlers::health::index))
            // job counters since startup, and live queue counts
            .route("/metrics", web::get().to(handlers::metrics::index))
            // submit post-processing work for a call
            .route("/calls/{call_sid}/{action}", web::post().to(handlers::job::add_call))
            .route("/analytics/{job_type}", web::post().to(handlers::job::add_analytics))
            .route("/integrations/{job_type}", web::post().to(handlers::job::add_integration))
            .service(
                web::scope("/queue")
                    // list jobs that ran out of attempts
                    .route("/{name}/failed", web::get().to(handlers::queue::failed_jobs))
                    // get everything stored about a single job
                    .route("/{name}/job/{job_id}", web::get().to(handlers::queue::job)),
            )
            // add middleware logger for access log
            .wrap(Logger::default())
    });

    // set number of worker threads if configured, or default to number of logical CPUs
    if let Some(num_workers) = config.server.threads {
        debug!("Using {} HTTP worker threads", num_workers);
        http_server = http_server.workers(num_workers);
    }

    let http_server_addr = config.server_addr();
    info!("Starting queue server at: {}", &http_server_addr);
    let served = http_server.bind(&http_server_addr)?.run().await;

    // the server has stopped accepting requests, drain queues before exiting
    if let Err(err) = service.shutdown().await {
        error!("{}", err);
    }
    served
}

/// Log level comes from the config file, `RUST_LOG` overrides it when set.
fn init_logging(server: &ServerConfig) {
    let level = server.log_level.to_string().to_lowercase();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
