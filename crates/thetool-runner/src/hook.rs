//! On-demand trigger hook (protocol version 1).
//!
//! [`HOOK_SCRIPT`] is evaluated in each JavaScript context. It defines
//! `startTheTool()`, `stopTheTool()` and `captureTheTool()` on the global
//! object. Each call logs `console.debug("thetool:v1:<command>", resolve, token)`
//! through the native `console.debug` and returns a promise. The host answers
//! by calling `resolve` through `Runtime.callFunctionOn`; the promise also
//! settles on its own after 30 seconds.

use serde_json::json;
use thetool_transport::{Connection, ConnectionError, protocol::ConsoleApiCalled};

pub const HOOK_VERSION: u32 = 1;

/// Prefix of the first `console.debug` argument of a trigger message.
pub const HOOK_PREFIX: &str = "thetool:v1:";

/// Seconds after which an unanswered trigger settles by itself.
pub const HOOK_TIMEOUT_SECS: u64 = 30;

pub const HOOK_SCRIPT: &str = r"(function () {
  'use strict';
  const scope = globalThis;
  if (scope.__thetoolHook === 1) {
    return;
  }
  const nativeDebug = console.debug;
  let token = 0;
  function send(command) {
    return new Promise((resolve) => {
      let timer;
      function finish() {
        clearTimeout(timer);
        resolve();
      }
      timer = setTimeout(finish, 30000);
      token += 1;
      nativeDebug.call(console, 'thetool:v1:' + command, finish, token);
    });
  }
  Object.defineProperty(scope, '__thetoolHook', { value: 1 });
  scope.startTheTool = () => send('start');
  scope.stopTheTool = () => send('stop');
  scope.captureTheTool = () => send('capture');
})();";

/// Function run on the continuation object to settle the trigger promise.
pub const RESOLVE_FUNCTION: &str = "function() { this(); }";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Stop,
    Capture,
}

impl Trigger {
    fn from_command(command: &str) -> Option<Self> {
        match command {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "capture" => Some(Self::Capture),
            _ => None,
        }
    }
}

/// A trigger message observed on the console channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCall {
    pub trigger: Trigger,
    /// Object id of the resolve function.
    pub continuation: Option<String>,
    pub token: Option<i64>,
}

impl TriggerCall {
    /// Recognise a trigger; `None` for ordinary console output.
    #[must_use]
    pub fn from_console(call: &ConsoleApiCalled) -> Option<Self> {
        if call.kind != "debug" {
            return None;
        }
        let mut args = call.args.iter();
        let command = args.next()?.as_str()?.strip_prefix(HOOK_PREFIX)?;
        let Some(trigger) = Trigger::from_command(command) else {
            tracing::warn!(command, "unknown on-demand trigger");
            return None;
        };
        let continuation = args.next().and_then(|arg| arg.object_id.clone());
        let token = args
            .next()
            .and_then(|arg| arg.value.as_ref())
            .and_then(serde_json::Value::as_i64);
        Some(Self {
            trigger,
            continuation,
            token,
        })
    }
}

/// Evaluate [`HOOK_SCRIPT`] in the connection's default context.
///
/// # Errors
/// Returns error if the evaluation request fails.
pub async fn install(conn: &Connection) -> Result<(), ConnectionError> {
    tracing::debug!(version = HOOK_VERSION, "installing on-demand hook");
    conn.send("Runtime.evaluate", json!({ "expression": HOOK_SCRIPT }))
        .await?;
    Ok(())
}

/// Settle the trigger promise behind `object_id`.
///
/// # Errors
/// Returns error if the call request fails.
pub async fn resolve(conn: &Connection, object_id: &str) -> Result<(), ConnectionError> {
    conn.send(
        "Runtime.callFunctionOn",
        json!({ "functionDeclaration": RESOLVE_FUNCTION, "objectId": object_id }),
    )
    .await?;
    Ok(())
}
