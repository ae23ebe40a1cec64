//! Push-notification hook.
//!
//! Incoming push payloads are turned into notifications; clicking one asks
//! the page to navigate to the notification's target.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PushConfig;
use crate::event::{EngineEvent, EventBus};

/// A notification ready to be shown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub url: String,
  pub tag: Option<String>,
  pub icon: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  url: Option<String>,
  tag: Option<String>,
  icon: Option<String>,
}

/// Displays notifications to the user.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification);
}

/// Notifier for headless runs: notifications only go to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, notification: &Notification) {
    info!(
      title = %notification.title,
      body = %notification.body,
      url = %notification.url,
      "Notification"
    );
  }
}

pub struct PushHook {
  defaults: PushConfig,
  notifier: Arc<dyn Notifier>,
  events: EventBus,
}

impl PushHook {
  pub fn new(defaults: PushConfig, notifier: Arc<dyn Notifier>, events: EventBus) -> Self {
    Self {
      defaults,
      notifier,
      events,
    }
  }

  /// Handle a push message. A payload that is not a JSON object is shown
  /// as the body text under the default title.
  pub fn on_push(&self, data: &[u8]) -> Notification {
    let payload = match serde_json::from_slice::<PushPayload>(data) {
      Ok(payload) => payload,
      Err(e) => {
        debug!(error = %e, "Push payload is not JSON, using raw text");
        let text = String::from_utf8_lossy(data).trim().to_string();
        PushPayload {
          body: (!text.is_empty()).then_some(text),
          ..PushPayload::default()
        }
      }
    };

    let notification = Notification {
      title: payload
        .title
        .unwrap_or_else(|| self.defaults.default_title.clone()),
      body: payload.body.unwrap_or_default(),
      url: payload
        .url
        .unwrap_or_else(|| self.defaults.default_url.clone()),
      tag: payload.tag,
      icon: payload.icon,
    };

    self.notifier.show(&notification);
    notification
  }

  /// The user clicked a notification.
  pub fn on_notification_click(&self, notification: &Notification) {
    self.events.emit(EngineEvent::Navigate {
      url: notification.url.clone(),
    });
  }
}
