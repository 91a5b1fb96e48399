use sorapool_schema::broker::{OpenData, code};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::error::SorapoolError;

/// Result of an open attempt, including how the endpoint was obtained.
#[derive(Debug, Clone)]
pub struct OpenOutcome {
    pub data: OpenData,
    /// Window is running headless.
    pub headless: bool,
    /// We attached to an already-open window instead of opening a new one.
    pub attached: bool,
    /// Headless was requested but the broker could not honor it.
    pub degraded: bool,
}

fn is_already_open(err: &SorapoolError) -> bool {
    match err {
        SorapoolError::Api { code: c, message } => {
            *c == code::ALREADY_OPEN || message.to_lowercase().contains("already open")
        }
        _ => false,
    }
}

fn is_process_not_found(err: &SorapoolError) -> bool {
    match err {
        SorapoolError::Api { code: c, message } => {
            *c == code::PROCESS_NOT_FOUND
                || message.to_lowercase().contains("process not found")
        }
        _ => false,
    }
}

/// Headless support differs between broker builds, and some profile states
/// (cloud backup in progress) reject it outright.
fn should_degrade_silent_open(err: &SorapoolError) -> bool {
    match err {
        SorapoolError::Api { code: c, message } => {
            if *c == code::HEADLESS_UNSUPPORTED {
                return true;
            }
            let lowered = message.to_lowercase();
            lowered.contains("headless") || lowered.contains("cloud backup")
        }
        _ => false,
    }
}

fn missing_endpoint() -> SorapoolError {
    SorapoolError::Connection("打开窗口成功，但未返回调试地址（ws/debugging_address）".to_string())
}

impl BrokerAdapter {
    /// Open a profile with the idempotent-retry discipline:
    /// up to `open_max_attempts` tries with a pause between them;
    /// on "already open" attach to the live endpoint, else close-then-open,
    /// then reset the open state once; a post-reset "already open" fails
    /// fast to avoid churning the broker.
    pub async fn open_profile_with_retry(
        &self,
        profile_id: i64,
        headless: bool,
    ) -> Result<OpenOutcome, SorapoolError> {
        let max_attempts = self.config().open_max_attempts.max(1);
        let pause = Duration::from_millis(self.config().open_retry_pause_ms);
        let mut reset_attempted = false;
        let mut last_error: Option<SorapoolError> = None;

        for attempt in 1..=max_attempts {
            match self.client().profile_open(profile_id, headless).await {
                Ok(data) if data.debug_endpoint().is_some() => {
                    return Ok(OpenOutcome {
                        data,
                        headless,
                        attached: false,
                        degraded: false,
                    });
                }
                Ok(_) => last_error = Some(missing_endpoint()),

                Err(err) if is_already_open(&err) => {
                    warn!(profile_id, attempt, "profile-open hit already-open, attaching");
                    if let Ok(Some(opened)) = self.client().opened_profile(profile_id).await
                        && opened.open.debug_endpoint().is_some()
                    {
                        info!(profile_id, "attached to already-open window");
                        return Ok(OpenOutcome {
                            data: opened.open,
                            headless: false,
                            attached: true,
                            degraded: false,
                        });
                    }

                    warn!(profile_id, "no debug endpoint to attach, close-then-open");
                    let _ = self.client().profile_close(profile_id).await;
                    match self.client().profile_open(profile_id, headless).await {
                        Ok(data) if data.debug_endpoint().is_some() => {
                            return Ok(OpenOutcome {
                                data,
                                headless,
                                attached: false,
                                degraded: false,
                            });
                        }
                        Ok(_) => last_error = Some(missing_endpoint()),
                        Err(err2) if is_already_open(&err2) => {
                            if reset_attempted {
                                // Reset already tried; more churn won't help.
                                warn!(profile_id, "still already-open after reset, failing fast");
                                return Err(err2);
                            }
                            reset_attempted = true;
                            warn!(profile_id, "close-then-open still already-open, resetting open state");
                            let _ = self.client().profile_open_state_reset(profile_id).await;
                            match self.client().profile_open(profile_id, headless).await {
                                Ok(data) if data.debug_endpoint().is_some() => {
                                    return Ok(OpenOutcome {
                                        data,
                                        headless,
                                        attached: false,
                                        degraded: false,
                                    });
                                }
                                Ok(_) => last_error = Some(missing_endpoint()),
                                Err(err3) if is_already_open(&err3) => {
                                    warn!(profile_id, "already-open survived open-state reset, failing fast");
                                    return Err(err3);
                                }
                                Err(err3) => last_error = Some(err3),
                            }
                        }
                        Err(err2) => last_error = Some(err2),
                    }
                }

                Err(err) if is_process_not_found(&err) => {
                    // Broker's window state and the local process disagree;
                    // force-close and let the next attempt reopen.
                    warn!(profile_id, attempt, "process not found, force-closing before reopen");
                    let _ = self.client().profile_close(profile_id).await;
                    last_error = Some(err);
                }

                Err(err) => last_error = Some(err),
            }

            if attempt < max_attempts {
                sleep(pause).await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| SorapoolError::Connection("打开窗口失败".to_string())))
    }

    /// Prefer a headless open; on known-incompatible failures re-open
    /// non-headless and record the degradation.
    pub async fn open_profile_silent(
        &self,
        profile_id: i64,
    ) -> Result<OpenOutcome, SorapoolError> {
        if !self.config().prefer_headless {
            return self.open_profile_with_retry(profile_id, false).await;
        }

        match self.open_profile_with_retry(profile_id, true).await {
            Ok(outcome) => Ok(outcome),
            Err(err) if should_degrade_silent_open(&err) => {
                warn!(profile_id, %err, "headless open unsupported, degrading to normal open");
                let outcome = self.open_profile_with_retry(profile_id, false).await?;
                Ok(OpenOutcome {
                    degraded: true,
                    ..outcome
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Best-effort close, waiting briefly for the broker to drop the window
    /// from its opened listing.
    pub async fn ensure_profile_closed(&self, profile_id: i64, wait: Duration) {
        let _ = self.client().profile_close(profile_id).await;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match self.client().opened_profile(profile_id).await {
                Ok(None) => return,
                Ok(Some(_)) => {}
                Err(_) => return,
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            sleep(Duration::from_millis(600)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_err(code: i64, message: &str) -> SorapoolError {
        SorapoolError::Api {
            code,
            message: message.to_string(),
        }
    }

    #[test]
    fn already_open_matches_code_and_text() {
        assert!(is_already_open(&api_err(111003, "x")));
        assert!(is_already_open(&api_err(-1, "The window is Already Open")));
        assert!(!is_already_open(&api_err(1009, "process not found")));
        assert!(!is_already_open(&SorapoolError::Connection("x".into())));
    }

    #[test]
    fn silent_open_degradation_heuristics() {
        assert!(should_degrade_silent_open(&api_err(2012, "x")));
        assert!(should_degrade_silent_open(&api_err(
            -1,
            "Headless mode not supported"
        )));
        assert!(should_degrade_silent_open(&api_err(
            -1,
            "cloud backup in progress"
        )));
        assert!(!should_degrade_silent_open(&api_err(111003, "already open")));
    }
}
