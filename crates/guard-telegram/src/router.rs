use std::sync::Arc;

use teloxide::{
    dispatching::Dispatcher, dptree, error_handlers::LoggingErrorHandler, prelude::*,
    types::AllowedUpdate, update_listeners::Polling,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use guard_core::{report::ErrorReporter, supervisor::SupervisorHandle};

use crate::convert::event_from_update;

pub fn allowed_updates() -> Vec<AllowedUpdate> {
    vec![
        AllowedUpdate::CallbackQuery,
        AllowedUpdate::ChosenInlineResult,
        AllowedUpdate::EditedMessage,
        AllowedUpdate::InlineQuery,
        AllowedUpdate::Message,
        AllowedUpdate::Poll,
        AllowedUpdate::PollAnswer,
        AllowedUpdate::ChatMember,
    ]
}

/// Long-poll the Bot API and hand every update to the supervisor until `cancel` fires.
pub async fn run_polling(
    bot: Bot,
    supervisor: SupervisorHandle,
    reporter: Arc<ErrorReporter>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "bot on the main thread is up and running"),
        Err(e) => {
            reporter.report(&e, Some("Bot launch failed"));
            return Err(e.into());
        }
    }

    let handler = dptree::entry().endpoint(forward_update);
    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![supervisor, reporter])
        .default_handler(|_| async {})
        .build();

    let token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        cancel.cancelled().await;
        if let Ok(done) = token.shutdown() {
            done.await;
        }
    });

    let listener = Polling::builder(bot)
        .allowed_updates(allowed_updates())
        .build();
    dispatcher
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    info!("polling stopped");
    Ok(())
}

async fn forward_update(
    update: Update,
    supervisor: SupervisorHandle,
    reporter: Arc<ErrorReporter>,
) -> ResponseResult<()> {
    let event = event_from_update(&update);
    if !supervisor.dispatch(event) {
        reporter.report("supervisor is not running", Some("Context handling error"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use guard_core::{
        domain::ChatId,
        event::Event,
        supervisor::Supervisor,
        worker::{EventHandler, TaskSpawner},
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle_event(&self, event: Event) {
            self.seen.lock().unwrap().push(event.update_id());
        }
    }

    fn poll_update(id: i64) -> Update {
        serde_json::from_value(serde_json::json!({
            "update_id": id,
            "poll_answer": {"poll_id": "p", "user": {"id": 1, "is_bot": false, "first_name": "B"}, "option_ids": [0]},
        }))
        .unwrap()
    }

    #[test]
    fn polls_for_message_and_edit_updates() {
        let updates = allowed_updates();
        assert!(updates.contains(&AllowedUpdate::Message));
        assert!(updates.contains(&AllowedUpdate::EditedMessage));
    }

    #[tokio::test]
    async fn updates_reach_a_worker() {
        let reporter = Arc::new(ErrorReporter::new(ChatId(-1), 100));
        let recorder = Arc::new(Recorder::default());
        let spawner = TaskSpawner::new(recorder.clone(), reporter.clone());
        let (sup, exits) = Supervisor::spawn_pool(&spawner, 1, reporter.clone()).await;
        let (handle, task) = sup.start(exits);

        forward_update(poll_update(3), handle.clone(), reporter.clone())
            .await
            .unwrap();
        tokio::task::yield_now().await;
        handle.shutdown();
        task.await.unwrap();

        // Let the worker drain after its channel closed.
        for _ in 0..50 {
            if !recorder.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec![3]);

        forward_update(poll_update(4), handle, reporter.clone())
            .await
            .unwrap();
        assert_eq!(
            reporter.drain(),
            vec!["Context handling error\nsupervisor is not running".to_string()]
        );
    }
}
