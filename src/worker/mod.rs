pub mod trial_notifications;

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::state::AppState;
use trial_notifications::TrialNotifier;

pub async fn start_background_workers(state: AppState) {
    let notifier = TrialNotifier::new(state.db.clone(), state.mailer.clone());
    let period = Duration::from_secs(state.config.trial_notification_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let sent = notifier.run_once(chrono::Utc::now()).await;
            if sent > 0 {
                info!(sent, "trial reminders sent");
            } else {
                debug!("no trial reminders due");
            }
        }
    });
}
