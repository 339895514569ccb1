// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Demo box: a counter, a match countdown driven by the hub itself, and a
//! scoreboard whose leader rotates to the back.

use std::sync::Arc;
use std::time::Duration;

use bento_core::Value;
use bento_kernel::{ActionError, ActionRegistry, DispatchError, Dispatcher, KernelConfig};
use serde_json::json;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Seconds the countdown starts from when the hub boots.
pub const START_COUNTDOWN: u32 = 5;

/// Default tree of the demo box.
pub fn defaults() -> Value {
    Value::from(json!({
        "count": 0,
        "obs": { "scene": null },
        "flavorText": "thingy",
        "nextMatch": null,
        "scoreboard": [
            { "name": "apple", "score": 1 },
            { "name": "banana", "score": 2 },
        ],
    }))
}

/// Restart signal shared between `setCount` and the ticker task.
#[derive(Debug, Clone, Default)]
pub struct Countdown {
    restart: Arc<Notify>,
}

impl Countdown {
    /// New, idle countdown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks `nextMatch` down once per `period` until it reaches zero (or is
    /// cleared), then sleeps until `setCount` runs again.
    pub async fn run(self, dispatcher: Dispatcher, period: Duration) {
        loop {
            self.restart.notified().await;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = self.restart.notified() => {
                        ticker.reset();
                    }
                    _ = ticker.tick() => {
                        match dispatcher.dispatch("tick", Value::Null).await {
                            Ok(outcome) if outcome.seq.is_some() => {}
                            Ok(_) => {
                                debug!("countdown idle");
                                break;
                            }
                            Err(err) if err.is_fatal() => {
                                warn!(%err, "countdown stopped");
                                return;
                            }
                            Err(err) => warn!(%err, "tick failed"),
                        }
                    }
                }
            }
        }
    }
}

/// Kernel configuration for the demo box. `countdown` is signalled each time
/// a `setCount` mutation runs.
pub fn kernel_config(countdown: &Countdown) -> KernelConfig {
    let mut actions = ActionRegistry::new();
    actions
        .register("increment", |draft, payload| {
            let by = match payload {
                Value::Null => 1.0,
                Value::Number(n) => n,
                other => {
                    return Err(ActionError::InvalidPayload(format!(
                        "increment takes a number, got {}",
                        other.kind()
                    )))
                }
            };
            draft.update(["count"], |count| {
                Value::Number(count.as_ref().and_then(Value::as_f64).unwrap_or_default() + by)
            })?;
            Ok(())
        })
        .register("setObsScene", |draft, payload| {
            draft.set(["obs", "scene"], payload)?;
            Ok(())
        })
        .register("updateScore", |draft, _payload| {
            draft.rotate_left(["scoreboard"], 1)?;
            Ok(())
        })
        .register("tick", |draft, _payload| {
            if let Some(left) = draft.get(["nextMatch"]).as_ref().and_then(Value::as_f64) {
                if left > 0.0 {
                    draft.set(["nextMatch"], left - 1.0)?;
                }
            }
            Ok(())
        });

    let restart = Arc::clone(&countdown.restart);
    actions.register("setCount", move |draft, payload| {
        match payload {
            Value::Null | Value::Number(_) => draft.set(["nextMatch"], payload)?,
            other => {
                return Err(ActionError::InvalidPayload(format!(
                    "setCount takes a number or null, got {}",
                    other.kind()
                )))
            }
        }
        restart.notify_one();
        Ok(())
    });

    KernelConfig::new(defaults()).with_actions(actions)
}

/// Startup hook run once the hub is up: arms the first match countdown.
pub async fn on_start(dispatcher: &Dispatcher) -> Result<(), DispatchError> {
    dispatcher
        .dispatch("setCount", Value::from(START_COUNTDOWN))
        .await
        .map(|_| ())
}
