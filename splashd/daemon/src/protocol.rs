//! Boot Client Protocol
//!
//! Messages exchanged over the boot socket. Each [`ClientRequest`] gets
//! exactly one [`Reply`]:
//!
//! | Request                                   | Reply                          |
//! |-------------------------------------------|--------------------------------|
//! | `ping`                                    | `ack` (without reaching the daemon) |
//! | `ask_for_password`, `ask_question`        | `answer`, `cancelled`, `no_answer` |
//! | `watch_keystroke`                         | `answer` or `no_answer`        |
//! | `deactivate`, `quit`                      | `ack` once the daemon is done  |
//! | `has_active_vt`                           | `bool`                         |
//! | everything else                           | `ack` after dispatch           |
//!
//! Requests that complete later carry a [`Trigger`] whose handler sends the
//! reply; the connection task simply awaits it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use splash_core::{Answer, BootRequest, Trigger};

/// A request sent by a boot client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Is the daemon alive
    Ping,
    /// New boot status text
    Update {
        /// Status text
        status: String,
    },
    /// Prompt for a password
    AskForPassword {
        /// Prompt text
        prompt: String,
    },
    /// Prompt for free text
    AskQuestion {
        /// Prompt text
        prompt: String,
    },
    /// Show a message
    DisplayMessage {
        /// Message text
        message: String,
    },
    /// Wait for a key
    WatchKeystroke {
        /// Keys of interest; omitted for any key
        #[serde(default)]
        keys: Option<String>,
    },
    /// Cancel a keystroke watch
    IgnoreKeystroke {
        /// Keys the watch was registered with
        #[serde(default)]
        keys: Option<String>,
    },
    /// Stop the progress clock
    PauseProgress,
    /// Restart the progress clock
    UnpauseProgress,
    /// Show the splash
    ShowSplash,
    /// Hide the splash
    HideSplash,
    /// The real root is mounted
    NewRoot {
        /// Mount point
        path: PathBuf,
    },
    /// Writable filesystems are available
    SystemInitialized,
    /// A boot service failed
    Error,
    /// Release the console
    Deactivate,
    /// Take the console back
    Reactivate,
    /// Tear down and exit
    Quit {
        /// Leave the last frame on screen
        #[serde(default)]
        retain_splash: bool,
    },
    /// Whether the daemon's VT is on screen
    HasActiveVt,
}

/// The daemon's answer to one [`ClientRequest`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    /// Request handled
    Ack,
    /// Text typed by the user, or the key that matched a watch
    Answer {
        /// The answer
        text: String,
    },
    /// Nobody could be asked, or the watch was ignored
    NoAnswer,
    /// The user cancelled the prompt
    Cancelled,
    /// Yes/no answer
    Bool {
        /// The value
        value: bool,
    },
}

impl Reply {
    fn from_answer(answer: Option<&Answer>) -> Self {
        match answer {
            Some(Answer::Text(text)) => Self::Answer { text: text.clone() },
            Some(Answer::Cancelled) => Self::Cancelled,
            None => Self::NoAnswer,
        }
    }
}

/// A request on its way to the daemon
///
/// `ack` is set for requests that complete during dispatch; the loop sends
/// [`Reply::Ack`] through it once the request has been handled.
#[derive(Debug)]
pub struct Envelope {
    /// Request for the daemon
    pub request: BootRequest,
    /// Acknowledged after dispatch
    pub ack: Option<oneshot::Sender<Reply>>,
}

impl Envelope {
    /// Envelope with no one waiting on it
    #[must_use]
    pub fn unacknowledged(request: BootRequest) -> Self {
        Self { request, ack: None }
    }

    /// Acknowledge the request if a client is waiting
    pub fn acknowledge(ack: Option<oneshot::Sender<Reply>>) {
        if let Some(ack) = ack {
            // client may already be gone
            let _ = ack.send(Reply::Ack);
        }
    }
}

fn answer_trigger(reply: oneshot::Sender<Reply>) -> Trigger<Answer> {
    Trigger::with_handler(move |answer: Option<&Answer>| {
        let _ = reply.send(Reply::from_answer(answer));
    })
}

fn ack_trigger(reply: oneshot::Sender<Reply>) -> Trigger {
    Trigger::with_handler(move |_| {
        let _ = reply.send(Reply::Ack);
    })
}

impl ClientRequest {
    /// Short name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Update { .. } => "update",
            Self::AskForPassword { .. } => "ask-for-password",
            Self::AskQuestion { .. } => "ask-question",
            Self::DisplayMessage { .. } => "display-message",
            Self::WatchKeystroke { .. } => "watch-keystroke",
            Self::IgnoreKeystroke { .. } => "ignore-keystroke",
            Self::PauseProgress => "pause-progress",
            Self::UnpauseProgress => "unpause-progress",
            Self::ShowSplash => "show-splash",
            Self::HideSplash => "hide-splash",
            Self::NewRoot { .. } => "newroot",
            Self::SystemInitialized => "system-initialized",
            Self::Error => "error",
            Self::Deactivate => "deactivate",
            Self::Reactivate => "reactivate",
            Self::Quit { .. } => "quit",
            Self::HasActiveVt => "has-active-vt",
        }
    }

    /// Route the request, wiring `reply` to its completion
    ///
    /// Returns `None` when the request was answered on the spot.
    #[must_use]
    pub fn into_envelope(self, reply: oneshot::Sender<Reply>) -> Option<Envelope> {
        let (request, ack) = match self {
            Self::Ping => {
                let _ = reply.send(Reply::Ack);
                return None;
            }
            Self::AskForPassword { prompt } => (
                BootRequest::AskForPassword {
                    prompt,
                    answer: answer_trigger(reply),
                },
                None,
            ),
            Self::AskQuestion { prompt } => (
                BootRequest::AskQuestion {
                    prompt,
                    answer: answer_trigger(reply),
                },
                None,
            ),
            Self::WatchKeystroke { keys } => (
                BootRequest::WatchKeystroke {
                    keys,
                    trigger: answer_trigger(reply),
                },
                None,
            ),
            Self::Deactivate => (
                BootRequest::Deactivate {
                    done: ack_trigger(reply),
                },
                None,
            ),
            Self::Quit { retain_splash } => (
                BootRequest::Quit {
                    retain_splash,
                    done: ack_trigger(reply),
                },
                None,
            ),
            Self::HasActiveVt => (
                BootRequest::HasActiveVt {
                    reply: Trigger::with_handler(move |active: Option<&bool>| {
                        let _ = reply.send(Reply::Bool {
                            value: active.copied().unwrap_or(false),
                        });
                    }),
                },
                None,
            ),
            Self::Update { status } => (BootRequest::Update { status }, Some(reply)),
            Self::DisplayMessage { message } => {
                (BootRequest::DisplayMessage { message }, Some(reply))
            }
            Self::IgnoreKeystroke { keys } => (BootRequest::IgnoreKeystroke { keys }, Some(reply)),
            Self::PauseProgress => (BootRequest::PauseProgress, Some(reply)),
            Self::UnpauseProgress => (BootRequest::UnpauseProgress, Some(reply)),
            Self::ShowSplash => (BootRequest::ShowSplash, Some(reply)),
            Self::HideSplash => (BootRequest::HideSplash, Some(reply)),
            Self::NewRoot { path } => (BootRequest::NewRoot { path }, Some(reply)),
            Self::SystemInitialized => (BootRequest::SystemInitialized, Some(reply)),
            Self::Error => (BootRequest::Error, Some(reply)),
            Self::Reactivate => (BootRequest::Reactivate, Some(reply)),
        };
        Some(Envelope { request, ack })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn route(request: ClientRequest) -> (Option<Envelope>, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (request.into_envelope(tx), rx)
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let json = serde_json::to_string(&ClientRequest::Quit {
            retain_splash: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"quit","retain_splash":true}"#);

        let parsed: ClientRequest = serde_json::from_str(r#"{"type":"quit"}"#).unwrap();
        assert_eq!(
            parsed,
            ClientRequest::Quit {
                retain_splash: false
            }
        );

        let parsed: ClientRequest =
            serde_json::from_str(r#"{"type":"watch_keystroke"}"#).unwrap();
        assert_eq!(parsed, ClientRequest::WatchKeystroke { keys: None });
    }

    #[test]
    fn test_ping_is_answered_without_the_daemon() {
        let (envelope, mut rx) = route(ClientRequest::Ping);
        assert!(envelope.is_none());
        assert_eq!(rx.try_recv().unwrap(), Reply::Ack);
    }

    #[test]
    fn test_fire_and_forget_waits_for_dispatch() {
        let (envelope, mut rx) = route(ClientRequest::Update {
            status: "fsck".to_string(),
        });
        let envelope = envelope.unwrap();
        assert!(matches!(envelope.request, BootRequest::Update { .. }));
        assert!(rx.try_recv().is_err());

        Envelope::acknowledge(envelope.ack);
        assert_eq!(rx.try_recv().unwrap(), Reply::Ack);
    }

    #[test]
    fn test_password_answer_reaches_client() {
        let (envelope, mut rx) = route(ClientRequest::AskForPassword {
            prompt: "Passphrase".to_string(),
        });
        let envelope = envelope.unwrap();
        assert!(envelope.ack.is_none());

        let BootRequest::AskForPassword { prompt, answer } = envelope.request else {
            panic!("expected ask-for-password");
        };
        assert_eq!(prompt, "Passphrase");
        answer.pull(Some(&Answer::Text("hunter2".to_string())));

        assert_eq!(
            rx.try_recv().unwrap(),
            Reply::Answer {
                text: "hunter2".to_string()
            }
        );
    }

    #[test]
    fn test_cancel_and_no_answer_replies() {
        let (envelope, mut rx) = route(ClientRequest::AskQuestion {
            prompt: "Name".to_string(),
        });
        let BootRequest::AskQuestion { answer, .. } = envelope.unwrap().request else {
            panic!("expected ask-question");
        };
        answer.pull(Some(&Answer::Cancelled));
        assert_eq!(rx.try_recv().unwrap(), Reply::Cancelled);

        let (envelope, mut rx) = route(ClientRequest::WatchKeystroke {
            keys: Some("cC".to_string()),
        });
        let BootRequest::WatchKeystroke { trigger, .. } = envelope.unwrap().request else {
            panic!("expected watch-keystroke");
        };
        trigger.pull(None);
        assert_eq!(rx.try_recv().unwrap(), Reply::NoAnswer);
    }

    #[test]
    fn test_has_active_vt_reply() {
        let (envelope, mut rx) = route(ClientRequest::HasActiveVt);
        let BootRequest::HasActiveVt { reply } = envelope.unwrap().request else {
            panic!("expected has-active-vt");
        };
        reply.pull(Some(&true));
        assert_eq!(rx.try_recv().unwrap(), Reply::Bool { value: true });
    }

    #[test]
    fn test_quit_acks_only_when_pulled() {
        let (envelope, mut rx) = route(ClientRequest::Quit {
            retain_splash: true,
        });
        let BootRequest::Quit {
            retain_splash,
            done,
        } = envelope.unwrap().request
        else {
            panic!("expected quit");
        };
        assert!(retain_splash);
        assert!(rx.try_recv().is_err());

        done.pull(None);
        assert_eq!(rx.try_recv().unwrap(), Reply::Ack);
    }

    #[test]
    fn test_names_match_boot_requests() {
        let (envelope, _rx) = route(ClientRequest::Deactivate);
        assert_eq!(
            envelope.unwrap().request.name(),
            ClientRequest::Deactivate.name()
        );
    }
}
