use std::sync::Arc;

use guard_core::{
    config::{Config, WorkerMode},
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    moderation::{ModerationFilter, ModerationPolicy},
    ratelimit::RateLimiter,
    report::ErrorReporter,
    saver::{JsonlArchive, MessageSaver, SavePolicy},
    supervisor::Supervisor,
    worker::{TaskSpawner, WorkerPipeline},
    Error, Result,
};
use guard_process::{run_worker_stdin, ProcessSpawner, WORKER_FLAG};
use guard_telegram::{router, TelegramMessenger};
use guard_unshorten::HttpResolver;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    guard_core::logging::init("guard")?;

    let cfg = Arc::new(
        Config::load().inspect_err(|e| error!("Environment validation failed: {e}"))?,
    );
    debug!(config = ?cfg, "configuration loaded");

    let bot = Bot::new(cfg.bot_token.clone());
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let reporter = Arc::new(ErrorReporter::new(
        cfg.report_chat_id,
        cfg.report_queue_limit,
    ));
    reporter.start(messenger.clone(), cfg.report_interval);

    let result = if std::env::args().any(|a| a == WORKER_FLAG) {
        run_worker(cfg, messenger, reporter.clone()).await
    } else {
        run_supervisor(cfg, bot, messenger, reporter.clone()).await
    };

    reporter.shutdown().await;
    result
}

async fn run_supervisor(
    cfg: Arc<Config>,
    bot: Bot,
    messenger: Arc<dyn MessagingPort>,
    reporter: Arc<ErrorReporter>,
) -> Result<()> {
    info!(pid = std::process::id(), mode = ?cfg.worker_mode, "Master {} is running", std::process::id());

    let mut in_process = None;
    let (supervisor, exits) = match cfg.worker_mode {
        WorkerMode::Process => {
            let spawner = ProcessSpawner::current_exe(reporter.clone())?;
            Supervisor::initialize(&spawner, cfg.workers, reporter.clone()).await
        }
        WorkerMode::Task => {
            let stack = WorkerStack::build(&cfg, messenger, reporter.clone())?;
            let spawner = TaskSpawner::new(stack.pipeline.clone(), reporter.clone());
            in_process = Some(stack);
            Supervisor::initialize(&spawner, cfg.workers, reporter.clone()).await
        }
    };
    let (handle, supervisor_task) = supervisor.start(exits);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            on_interrupt.cancel();
        }
    });

    let polled = router::run_polling(bot, handle.clone(), reporter.clone(), cancel).await;

    handle.shutdown();
    if let Err(e) = supervisor_task.await {
        reporter.report(e, Some("Supervisor task failed"));
    }
    if let Some(stack) = in_process {
        stack.shutdown().await;
    }

    polled.map_err(|e| Error::External(format!("telegram bot failed: {e}")))
}

async fn run_worker(
    cfg: Arc<Config>,
    messenger: Arc<dyn MessagingPort>,
    reporter: Arc<ErrorReporter>,
) -> Result<()> {
    let stack = WorkerStack::build(&cfg, messenger, reporter.clone())?;

    // The supervisor ends workers by closing stdin; a terminal interrupt must not kill
    // them first.
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("worker waiting for supervisor to close input");
        }
    });

    run_worker_stdin(stack.pipeline.clone(), reporter).await;
    stack.shutdown().await;
    Ok(())
}

/// Everything one worker needs to handle events.
struct WorkerStack {
    pipeline: Arc<WorkerPipeline>,
    limiter: Arc<RateLimiter>,
    saver: Arc<MessageSaver>,
}

impl WorkerStack {
    fn build(
        cfg: &Config,
        messenger: Arc<dyn MessagingPort>,
        reporter: Arc<ErrorReporter>,
    ) -> Result<Self> {
        let resolver = Arc::new(HttpResolver::new(cfg.resolve_timeout)?);

        let limiter = Arc::new(RateLimiter::new());
        limiter.start_sweeper(cfg.rate_limit_sweep);

        info!(path = %cfg.archive_path.display(), "archiving messages");
        let saver = Arc::new(MessageSaver::new(
            Arc::new(JsonlArchive::new(cfg.archive_path.clone())),
            limiter.clone(),
            reporter.clone(),
            SavePolicy {
                max_per_window: cfg.save_rate_limit,
                window: cfg.save_rate_window,
            },
        ));

        let moderation = ModerationFilter::new(
            ModerationPolicy {
                admin_id: cfg.admin_id,
                no_channel_links: cfg.no_channel_links,
                resolve_timeout: cfg.resolve_timeout,
            },
            resolver,
            messenger,
            reporter,
        );

        Ok(Self {
            pipeline: Arc::new(WorkerPipeline::new(moderation, saver.clone())),
            limiter,
            saver,
        })
    }

    async fn shutdown(&self) {
        self.saver.shutdown().await;
        self.limiter.shutdown();
    }
}
