use std::io::Write;
use std::process;

use render_queue::{
    config::{self, DemoArgs, Settings},
    demo::{self, DemoOptions},
    error::AppError,
    infra::{error::InfraError, telemetry},
    queue::COMMON_HTML_PATTERNS,
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Demo(Box::<DemoArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Demo(args) => run_demo(settings, *args).await,
    }
}

async fn run_demo(settings: Settings, args: DemoArgs) -> Result<(), AppError> {
    let pool = settings.queued_rendering.build_pool();
    if pool.cache_enabled() {
        pool.warm_cache(COMMON_HTML_PATTERNS.iter().copied());
    }

    let options = DemoOptions::from(&args);
    info!(
        enabled = settings.queued_rendering.enabled,
        capacity = pool.capacity(),
        cache = pool.cache_enabled(),
        requests = options.requests,
        components = options.components,
        delay_ms = args.delay_ms,
        "Starting queued rendering demo"
    );

    let results = demo::run(&pool, &options).await;

    let mut first_failure = None;
    for (index, request) in results.iter().enumerate() {
        let report = &request.report;
        match &request.document {
            Ok(document) => info!(
                request = index,
                request_id = %report.request_id,
                nodes = report.nodes_created,
                chunks = report.chunks,
                bytes = document.len(),
                slots_high_watermark = report.slots_high_watermark,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Demo request rendered"
            ),
            Err(failure) => {
                warn!(
                    request = index,
                    request_id = %report.request_id,
                    error = %failure,
                    "Demo request failed"
                );
                first_failure.get_or_insert_with(|| failure.clone());
            }
        }
    }

    let stats = pool.stats();
    info!(
        acquired_from_pool = stats.acquired_from_pool,
        acquired_new = stats.acquired_new,
        released = stats.released,
        released_dropped = stats.released_dropped,
        hit_rate = stats.hit_rate(),
        content_cache_hit = stats.content_cache_hit,
        content_cache_miss = stats.content_cache_miss,
        slots_high_watermark = stats.slots_high_watermark,
        capacity = stats.capacity,
        "Pool statistics"
    );

    if args.print
        && let Some(Ok(document)) = results.first().map(|request| &request.document)
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{document}").map_err(InfraError::from)?;
    }

    pool.close();

    match first_failure {
        Some(failure) => Err(AppError::Render(failure)),
        None => Ok(()),
    }
}
