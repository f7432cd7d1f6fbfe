//! Guest clock resync.
//!
//! A resumed guest's clock still reads the time the snapshot was taken.
//! The in-guest agent fixes that on `POST /sync`; this client keeps asking
//! until the agent answers with a 2xx or the sandbox goes away.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Upper bound on a single `/sync` request.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// How a resync loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced { attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Client for one guest agent's `/sync` endpoint.
#[derive(Debug, Clone)]
pub struct ClockSync {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl ClockSync {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        vm_ip: Ipv4Addr,
        agent_port: u16,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            url: format!("http://{vm_ip}:{agent_port}/sync"),
            interval,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Retry `/sync` every `interval` until it succeeds or `cancel` fires.
    pub async fn run(&self, cancel: &CancellationToken) -> SyncOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            tokio::select! {
                biased;
                () = cancel.cancelled() => return SyncOutcome::Cancelled { attempts },
                result = self.attempt() => match result {
                    Ok(()) => return SyncOutcome::Synced { attempts },
                    Err(reason) => {
                        tracing::debug!(
                            url = %self.url,
                            attempts,
                            %reason,
                            "clock sync attempt failed"
                        );
                    }
                },
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return SyncOutcome::Cancelled { attempts },
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn attempt(&self) -> Result<(), String> {
        let resp = self
            .client
            .post(&self.url)
            .timeout(ATTEMPT_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        // Drain so the connection can be reused.
        let _ = resp.bytes().await;
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("HTTP {status}"))
        }
    }
}
